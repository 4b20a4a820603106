//! Discussion assembly.
//!
//! Front ends build the full prompt out of blocks: the persona's rendered
//! conditioning first, then per-turn user prefix, user text, link text and
//! AI prefix, with generated replies appended as they complete.

use crate::personality::Personality;

/// Accumulates discussion blocks and flattens them into one prompt.
#[derive(Debug, Clone)]
pub struct Discussion {
    conditioning: String,
    blocks: Vec<String>,
}

impl Discussion {
    /// Start a discussion conditioned by the given persona.
    pub fn new(persona: &Personality) -> Self {
        Self {
            conditioning: persona.conditioning_text(),
            blocks: Vec::new(),
        }
    }

    /// Open with the persona's welcome message, when it has one.
    pub fn greet(&mut self, persona: &Personality) {
        if persona.welcome_message.is_empty() {
            return;
        }
        self.blocks.push(persona.ai_message_prefix.clone());
        self.blocks.push(persona.welcome_message.clone());
        self.blocks.push(persona.link_text.clone());
    }

    /// Append one user turn, leaving the discussion ready for the model
    /// to continue after the AI prefix.
    pub fn push_user_turn(&mut self, persona: &Personality, text: &str) {
        self.blocks.push(persona.user_message_prefix.clone());
        self.blocks.push(text.to_string());
        self.blocks.push(persona.link_text.clone());
        self.blocks.push(persona.ai_message_prefix.clone());
    }

    /// Append text the model generated.
    pub fn push_model_text(&mut self, text: &str) {
        self.blocks.push(text.to_string());
    }

    /// The full prompt: conditioning followed by every block in order.
    pub fn flatten(&self) -> String {
        let mut prompt = self.conditioning.clone();
        for block in &self.blocks {
            prompt.push_str(block);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_persona() -> Personality {
        Personality {
            conditioning: "Be helpful.".to_string(),
            welcome_message: "Hi!".to_string(),
            user_message_prefix: "### Human:".to_string(),
            ai_message_prefix: "### Assistant:".to_string(),
            link_text: "\n".to_string(),
            ..Personality::default()
        }
    }

    #[test]
    fn test_flatten_orders_blocks() {
        let persona = plain_persona();
        let mut discussion = Discussion::new(&persona);
        discussion.push_user_turn(&persona, "hello");

        assert_eq!(
            discussion.flatten(),
            "Be helpful.### Human:hello\n### Assistant:"
        );
    }

    #[test]
    fn test_greeting_and_reply_round_trip() {
        let persona = plain_persona();
        let mut discussion = Discussion::new(&persona);
        discussion.greet(&persona);
        discussion.push_user_turn(&persona, "hello");
        discussion.push_model_text("hi there");

        assert_eq!(
            discussion.flatten(),
            "Be helpful.### Assistant:Hi!\n### Human:hello\n### Assistant:hi there"
        );
    }

    #[test]
    fn test_empty_welcome_message_adds_nothing() {
        let mut persona = plain_persona();
        persona.welcome_message = String::new();
        let mut discussion = Discussion::new(&persona);
        discussion.greet(&persona);
        assert_eq!(discussion.flatten(), "Be helpful.");
    }
}
