use std::sync::Arc;

use shared::{
    domain::{ConversationId, MessageId},
    protocol::Message,
};
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    gateway::{Gateway, RequestDescriptor},
};

#[derive(Clone)]
pub struct HistoryLoader {
    gateway: Arc<Gateway>,
    page_size: u32,
    max_pages: u32,
}

impl HistoryLoader {
    pub fn new(gateway: Arc<Gateway>, page_size: u32, max_pages: u32) -> Self {
        Self {
            gateway,
            page_size: page_size.clamp(1, 500),
            max_pages: max_pages.max(1),
        }
    }

    pub async fn load_page(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, ClientError> {
        let mut request =
            RequestDescriptor::get(format!("/conversations/{}/messages", conversation_id.0))
                .query("limit", self.page_size);
        if let Some(before) = before {
            request = request.query("before", before);
        }
        self.gateway.execute_json(&request).await
    }

    /// The whole backlog, oldest first, walking pages backwards until the
    /// server returns a short page or the page budget runs out.
    pub async fn load(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ClientError> {
        let mut pages: Vec<Vec<Message>> = Vec::new();
        let mut before = None;

        for page_number in 0..self.max_pages {
            let page = self.load_page(conversation_id, before).await?;
            let short_page = page.len() < self.page_size as usize;
            before = page.first().map(|message| message.id);
            debug!(
                conversation_id = conversation_id.0,
                page_number,
                count = page.len(),
                "history: page loaded"
            );
            pages.push(page);
            if short_page || before.is_none() {
                return Ok(pages.into_iter().rev().flatten().collect());
            }
        }

        warn!(
            conversation_id = conversation_id.0,
            max_pages = self.max_pages,
            "history: page budget exhausted, older messages not loaded"
        );
        Ok(pages.into_iter().rev().flatten().collect())
    }
}
