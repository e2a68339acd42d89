//! Conversational retrieval chain with buffer memory
//!
//! Follow-up questions are first rewritten into standalone questions using
//! the chat history, then answered from the top-k retrieved chunks stuffed
//! into a single prompt.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::assistant::{Assistant, AssistantError, Result};
use crate::index::VectorIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Answer plus the full history including this exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub answer: String,
    pub chat_history: Vec<ChatMessage>,
    #[serde(skip)]
    pub cached: bool,
}

pub struct Conversation {
    assistant: Assistant,
    index: VectorIndex,
    history: Vec<ChatMessage>,
    last_question: Option<String>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("chunks", &self.index.len())
            .field("turns", &(self.history.len() / 2))
            .field("last_question", &self.last_question)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    pub(crate) fn new(assistant: Assistant, index: VectorIndex) -> Self {
        if index.is_empty() {
            warn!("conversation created over an empty index");
        }
        Self {
            assistant,
            index,
            history: Vec::new(),
            last_question: None,
        }
    }

    #[cfg(test)]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Answer `question` in the context of the conversation so far.
    ///
    /// Repeating the immediately preceding question returns the previous
    /// answer without calling the models again.
    #[instrument(skip_all, fields(history = self.history.len()))]
    pub async fn ask(&mut self, question: &str) -> Result<Reply> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AssistantError::EmptyQuestion);
        }

        if self.last_question.as_deref() == Some(question) {
            if let Some(answer) = self.history.last() {
                debug!("repeated question, returning previous answer");
                return Ok(Reply {
                    answer: answer.content.clone(),
                    chat_history: self.history.clone(),
                    cached: true,
                });
            }
        }

        let standalone = if self.history.is_empty() {
            question.to_string()
        } else {
            self.assistant
                .generate(condense_prompt(&self.history, question), "condense_question")
                .await?
        };

        let query = self.assistant.embed_query(&standalone).await?;
        let top_k = self.assistant.settings().top_k;
        let hits = self.index.search(&query, top_k);
        debug!(
            retrieved = hits.len(),
            best_score = hits.first().map(|h| h.score),
            "context retrieved"
        );
        let context: Vec<&str> = hits.iter().map(|hit| hit.text).collect();

        let answer = self
            .assistant
            .generate(answer_prompt(&context, &standalone), "answer_question")
            .await?;

        self.history.push(ChatMessage {
            role: Role::User,
            content: question.to_string(),
        });
        self.history.push(ChatMessage {
            role: Role::Assistant,
            content: answer.clone(),
        });
        self.last_question = Some(question.to_string());
        info!(turns = self.history.len() / 2, "question answered");

        Ok(Reply {
            answer,
            chat_history: self.history.clone(),
            cached: false,
        })
    }

    /// Drop the repeat-question shortcut, so the next question is answered
    /// afresh even if it matches the last one.
    pub fn forget_last_question(&mut self) {
        self.last_question = None;
    }
}

fn condense_prompt(history: &[ChatMessage], question: &str) -> String {
    let transcript: String = history
        .iter()
        .map(|m| match m.role {
            Role::User => format!("\nHuman: {}", m.content),
            Role::Assistant => format!("\nAssistant: {}", m.content),
        })
        .collect();
    format!(
        "Given the following conversation and a follow up question, rephrase the follow up question to be a standalone question, in its original language.\n\nChat History:\n{}\nFollow Up Input: {}\nStandalone question:",
        transcript.trim_start(),
        question
    )
}

fn answer_prompt(context: &[&str], question: &str) -> String {
    format!(
        "Use the following pieces of context to answer the question at the end. If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n{}\n\nQuestion: {}\nHelpful Answer:",
        context.join("\n\n"),
        question
    )
}
