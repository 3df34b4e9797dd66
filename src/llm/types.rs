//! Message types for LLM communication.
//!
//! Defines the request messages sent to providers and the bounded question
//! history used when building prompts.

use serde::{Deserialize, Serialize};

/// Role of a message in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing context and instructions.
    System,
    /// User message (the assembled instruction).
    User,
    /// Assistant message (LLM response).
    Assistant,
}

impl Role {
    /// Returns the role as a string for API requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender.
    pub role: Role,
    /// The content of the message.
    pub content: String,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Prior user questions of one conversation, oldest first.
///
/// Holds at most `capacity` entries; pushing past the cap drops the oldest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionHistory {
    questions: Vec<String>,
    capacity: usize,
}

impl QuestionHistory {
    /// Creates an empty history holding at most `capacity` questions.
    pub fn new(capacity: usize) -> Self {
        Self {
            questions: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Builds a history from chronologically ordered questions, keeping the
    /// most recent `capacity`.
    pub fn from_questions<I, S>(questions: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut history = Self::new(capacity);
        for question in questions {
            history.push(question);
        }
        history
    }

    /// Appends a question, evicting the oldest one when full.
    pub fn push(&mut self, question: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.questions.len() == self.capacity {
            self.questions.remove(0);
        }
        self.questions.push(question.into());
    }

    /// Returns the most recent `n` questions, oldest first.
    pub fn recent(&self, n: usize) -> &[String] {
        let start = self.questions.len().saturating_sub(n);
        &self.questions[start..]
    }

    /// Returns all questions, oldest first.
    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    /// Returns the number of questions held.
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Returns true if no questions are held.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let sys = Message::system("You are helpful");
        assert_eq!(sys.role, Role::System);
        assert_eq!(sys.content, "You are helpful");

        let user = Message::user("Hello");
        assert_eq!(user.role, Role::User);

        let assistant = Message::assistant("Hi there");
        assert_eq!(assistant.role, Role::Assistant);
    }

    #[test]
    fn test_role_as_str() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn test_history_drops_oldest() {
        let history = QuestionHistory::from_questions((1..=12).map(|i| format!("q{i}")), 10);
        assert_eq!(history.len(), 10);
        assert_eq!(history.questions()[0], "q3");
        assert_eq!(history.questions()[9], "q12");
    }

    #[test]
    fn test_history_recent() {
        let history = QuestionHistory::from_questions(["a", "b", "c"], 10);
        assert_eq!(history.recent(2), ["b".to_string(), "c".to_string()]);
        assert_eq!(history.recent(5).len(), 3);
    }

    #[test]
    fn test_zero_capacity_history_stays_empty() {
        let mut history = QuestionHistory::new(0);
        history.push("ignored");
        assert!(history.is_empty());
    }
}
