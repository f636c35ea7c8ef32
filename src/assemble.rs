//! Prompt assembly: retrieved context plus recent history, sent to the LLM.

use std::sync::Arc;

use crate::config::ConversationConfig;
use crate::error::Result;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{ConversationTurn, Role, ScoredChunk};
use crate::retrieve::Retriever;

pub const DEFAULT_INSTRUCTIONS: &str = "You are IMOS, an intelligent memory OS for professionals and solopreneurs. \
You help users understand and analyze their documents through natural conversation.";

const GUIDELINES: &str = "Guidelines:\n\
- Use the provided context to answer questions accurately\n\
- Reference specific documents when citing information\n\
- If the context doesn't contain relevant information, say so politely\n\
- Maintain conversation flow and refer to previous exchanges when relevant\n\
- Be concise but thorough in your responses";

const NO_CONTEXT: &str = "(no stored passage was similar enough to this question)";

/// An answer with the chunks it was grounded on, best match first.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<ScoredChunk>,
}

pub struct Assembler {
    retriever: Retriever,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
    conversation: ConversationConfig,
}

impl Assembler {
    pub fn new(
        retriever: Retriever,
        chat: Arc<dyn ChatModel>,
        top_k: usize,
        conversation: ConversationConfig,
    ) -> Self {
        Self {
            retriever,
            chat,
            top_k,
            conversation,
        }
    }

    /// Answer `query` in the context of `history`.
    ///
    /// Retrieval failures (including an empty store) return before the
    /// LLM is called.
    pub async fn ask(&self, query: &str, history: &[ConversationTurn]) -> Result<Answer> {
        let sources = self.retriever.query(query, self.top_k).await?;
        let messages = self.build_messages(query, history, &sources);
        tracing::debug!(
            messages = messages.len(),
            sources = sources.len(),
            "sending chat completion"
        );
        let text = self.chat.complete(&messages).await?;
        Ok(Answer { text, sources })
    }

    /// System prompt, the last `max_history_turns` turns, then the query.
    pub fn build_messages(
        &self,
        query: &str,
        history: &[ConversationTurn],
        sources: &[ScoredChunk],
    ) -> Vec<ChatMessage> {
        let instructions = self
            .conversation
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_INSTRUCTIONS);
        let system = format!(
            "{}\n\nRELEVANT DOCUMENT CONTEXT:\n{}\n\n{}",
            instructions,
            context_block(sources),
            GUIDELINES
        );

        let keep = self.conversation.max_history_turns;
        let start = history.len().saturating_sub(keep);
        let mut messages = Vec::with_capacity(keep + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history[start..].iter().map(|turn| match turn.role {
            Role::User => ChatMessage::user(&turn.text),
            Role::Assistant => ChatMessage::assistant(&turn.text),
        }));
        messages.push(ChatMessage::user(query));
        messages
    }
}

/// Retrieved chunks in ranked order, each labelled with its document.
pub fn context_block(sources: &[ScoredChunk]) -> String {
    if sources.is_empty() {
        return NO_CONTEXT.to_string();
    }
    sources
        .iter()
        .map(|s| format!("{}:\n{}", s.chunk.document_name, s.chunk.text))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::error::Error;
    use crate::store::testing::{chunk, doc};
    use crate::store::{DocumentStore, InMemoryStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingModel {
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatModel for RecordingModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.lock().unwrap().push(messages.to_vec());
            Ok("The lease renews in March.".to_string())
        }
    }

    async fn assembler(
        texts: &[(&str, &str)],
        max_history_turns: usize,
    ) -> (Assembler, Arc<RecordingModel>) {
        let embedder = Arc::new(HashEmbedder::new(128));
        let store = Arc::new(InMemoryStore::new());
        for (id, text) in texts {
            store
                .insert_chunks(
                    &doc(id),
                    &[chunk(id, 0, text, embedder.vector_for(text).unwrap())],
                )
                .await
                .unwrap();
        }
        let model = Arc::new(RecordingModel::default());
        let conversation = ConversationConfig {
            max_history_turns,
            system_prompt: None,
        };
        let assembler = Assembler::new(
            Retriever::new(store, embedder),
            model.clone(),
            2,
            conversation,
        );
        (assembler, model)
    }

    #[tokio::test]
    async fn prompt_carries_context_history_and_query() {
        let (assembler, model) = assembler(
            &[
                ("lease", "The office lease renews in March"),
                ("plants", "Water the plants on Fridays"),
                ("budget", "Budget review is due in April"),
            ],
            10,
        )
        .await;
        let history = vec![
            ConversationTurn::user("hello"),
            ConversationTurn::assistant("Hi! Ask me about your documents."),
        ];

        let answer = assembler
            .ask("When does the office lease renew?", &history)
            .await
            .unwrap();
        assert_eq!(answer.text, "The lease renews in March.");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[0].chunk.document_id, "lease");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let messages = &calls[0];
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("RELEVANT DOCUMENT CONTEXT:"));
        assert!(messages[0]
            .content
            .contains("lease.pdf:\nThe office lease renews in March\n---\n"));
        assert_eq!(messages[1], ChatMessage::user("hello"));
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(
            messages[3],
            ChatMessage::user("When does the office lease renew?")
        );
    }

    #[tokio::test]
    async fn history_is_truncated_to_the_most_recent_turns() {
        let (assembler, model) = assembler(&[("a", "some stored text")], 3).await;
        let history: Vec<ConversationTurn> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationTurn::user(format!("question {i}"))
                } else {
                    ConversationTurn::assistant(format!("answer {i}"))
                }
            })
            .collect();

        assembler.ask("stored text?", &history).await.unwrap();
        let calls = model.calls.lock().unwrap();
        let contents: Vec<&str> = calls[0][1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["answer 5", "question 6", "answer 7", "stored text?"]);
    }

    #[tokio::test]
    async fn empty_store_never_reaches_the_model() {
        let (assembler, model) = assembler(&[], 10).await;
        assert!(matches!(
            assembler.ask("anything?", &[]).await,
            Err(Error::EmptyStore)
        ));
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn context_block_without_sources_says_so() {
        assert_eq!(context_block(&[]), NO_CONTEXT);
    }
}
