use std::sync::Arc;

use async_trait::async_trait;

use super::{Granularity, Humanizer, TextGenerator};
use crate::errors::CollaboratorError;

/// Humanizer that rewrites through a text generator.
pub struct LlmHumanizer {
    generator: Arc<dyn TextGenerator>,
}

impl LlmHumanizer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn instruction(text: &str, granularity: Granularity) -> String {
        let scope = match granularity {
            Granularity::Full => {
                "Rewrite the whole text in a natural human voice. Vary sentence length and \
                 structure, and prefer concrete wording over generic phrasing."
            }
            Granularity::Sentence => {
                "Keep the paragraph structure. Rework only sentences that read as formulaic, \
                 changing rhythm and word choice while keeping their meaning."
            }
        };
        format!(
            "{scope}\n\nRules:\n- Keep every parenthetical citation exactly as written.\n\
             - Keep paragraph breaks.\n- Do not use contractions.\n\
             - Return only the rewritten text.\n\nTEXT:\n{text}"
        )
    }
}

#[async_trait]
impl Humanizer for LlmHumanizer {
    async fn rewrite(&self, text: &str, granularity: Granularity) -> Result<String, CollaboratorError> {
        self.generator
            .generate(&Self::instruction(text, granularity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, instruction: &str) -> Result<String, CollaboratorError> {
            self.seen.lock().unwrap().push(instruction.to_string());
            Ok("rewritten".into())
        }
    }

    #[tokio::test]
    async fn instruction_depends_on_granularity() {
        let echo = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let humanizer = LlmHumanizer::new(echo.clone());
        humanizer.rewrite("Body.", Granularity::Full).await.unwrap();
        humanizer.rewrite("Body.", Granularity::Sentence).await.unwrap();

        let seen = echo.seen.lock().unwrap();
        assert!(seen[0].starts_with("Rewrite the whole text"));
        assert!(seen[1].starts_with("Keep the paragraph structure"));
        assert!(seen.iter().all(|s| s.ends_with("TEXT:\nBody.")));
    }
}
