//! Message routing: validate, persist, then deliver.

use crate::error::SendError;
use crate::protocol::{Identity, Message};
use crate::server::SharedState;

use super::helpers::delivery_targets;

/// Persist a direct message and deliver it to every live handle of the
/// sender and the recipient, once each.
///
/// Nothing is delivered unless the store accepted the message. Rejections
/// are returned to the caller, which reports them to the sender only.
pub fn submit(
    state: &SharedState,
    sender: &Identity,
    recipient_id: &str,
    text: &str,
) -> Result<Message, SendError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SendError::EmptyText);
    }
    if text.len() > state.config.max_message_len {
        return Err(SendError::TextTooLong);
    }

    // Recipient must be known, not necessarily online
    let recipient = match state.store.find_identity(recipient_id) {
        Ok(Some(recipient)) => recipient,
        Ok(None) => return Err(SendError::UnknownRecipient),
        Err(e) => {
            tracing::error!(user = %sender.id, recipient = recipient_id, "Recipient lookup failed: {e}");
            return Err(SendError::PersistenceFailed);
        }
    };

    let message = state
        .store
        .append(sender, &recipient, text)
        .map_err(|e| {
            tracing::error!(user = %sender.id, recipient = recipient_id, "Failed to persist message: {e}");
            SendError::PersistenceFailed
        })?;

    // Fresh lookup: handles that left while the write ran are skipped.
    // A handle joining meanwhile gets its backlog queued before this copy.
    let locks = state.pair_locks(&sender.id, &recipient.id);
    let _parties: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();
    let targets = delivery_targets(&state.presence, &sender.id, &recipient.id);
    let mut delivered = 0;
    for handle in &targets {
        if state.deliver_message(*handle, &message) {
            delivered += 1;
        }
    }
    tracing::debug!(
        msgid = %message.id,
        user = %sender.id,
        recipient = %recipient.id,
        targets = targets.len(),
        delivered,
        "Message routed"
    );
    Ok(message)
}
