//! Bridges the message store and chat transport to a group's message-lane
//! container: the piece that decides "is there anything new to tell the
//! agent, and if so what do we do with what it says back."
//!
//! The prompt envelope mirrors `router::format_messages`'s timestamped
//! transcript style; container invocation goes through
//! `container_runner::run_container_streaming` so textual results can be
//! relayed to chat as they arrive rather than only after the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ngb_config::Config;
use ngb_db::{Database, MessageRepository};
use ngb_types::{ContainerEvent, Message, MessageRole, RegisteredGroup};
use regex::Regex;
use tracing::{error, warn};

use crate::container_handle::{ContainerHandle, Lane};
use crate::container_runner::{run_container_streaming, ContainerInput};
use crate::group_queue::GroupQueue;
use crate::ipc_handler::ChannelSender;
use crate::router::format_messages;

/// Strip `<internal>...</internal>` spans the agent uses for private
/// scratch notes that should never reach chat. This is the one tag the
/// wire format defines; anything else passes through untouched.
fn strip_internal_tags(text: &str) -> String {
    let re = Regex::new(r"(?s)<internal>.*?</internal>").expect("static regex");
    re.replace_all(text, "").trim().to_string()
}

/// Process one round of a group's message lane: pull new messages since
/// `watermark`, hand them to the container, and relay any textual result
/// back to chat. Returns `true` iff the container exited cleanly (including
/// the trivial case where there was nothing new to process).
pub async fn process_group_messages(
    group: &RegisteredGroup,
    watermark: DateTime<Utc>,
    assistant_name: &str,
    config: &Config,
    db: &Arc<Database>,
    channels: &Arc<Vec<Box<dyn ChannelSender>>>,
    group_queue: &GroupQueue,
) -> bool {
    let message_repo = MessageRepository::new(db, config.message_cache_size);
    let messages = match message_repo.get_messages_since(&group.jid, watermark).await {
        Ok(msgs) => msgs,
        Err(e) => {
            error!(group_jid = %group.jid, error = %e, "Failed to load messages since watermark");
            return false;
        }
    };

    let inbound: Vec<Message> = messages
        .into_iter()
        .filter(|m| m.role != MessageRole::Assistant)
        .collect();

    if inbound.is_empty() {
        return true;
    }

    let latest_inbound_id = inbound.last().map(|m| m.id.clone());
    let prompt = format_messages(&inbound);

    let is_main = group.folder == config.main_group_folder;
    let input = ContainerInput {
        prompt,
        session_id: None,
        group_folder: group.folder.clone(),
        chat_jid: group.jid.clone(),
        is_main,
        is_scheduled_task: false,
        assistant_name: Some(assistant_name.to_string()),
    };

    let additional_mounts = group
        .container_config
        .as_ref()
        .and_then(|c| c.get("additional_mounts"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_object())
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<HashMap<_, _>>()
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let channels = channels.clone();
    let latest_id = latest_inbound_id.clone();
    let group_jid_owned = group.jid.clone();
    let group_queue_for_output = group_queue.clone();
    let on_output: crate::container_runner::OnOutputHook = Box::new(move |event: ContainerEvent| {
        let channels = channels.clone();
        let group_jid = group_jid_owned.clone();
        let latest_id = latest_id.clone();
        let group_queue = group_queue_for_output.clone();
        Box::pin(async move {
            if let Some(text) = event.text() {
                let cleaned = strip_internal_tags(text);
                if !cleaned.is_empty() {
                    for ch in channels.iter() {
                        if ch.owns_jid(&group_jid) {
                            if let Err(e) = ch
                                .send_message(&group_jid, &cleaned, latest_id.as_deref())
                                .await
                            {
                                warn!(group_jid = %group_jid, error = %e, "Failed to relay container output to chat");
                            }
                            break;
                        }
                    }
                }
            }

            // The container is still alive, waiting on further stdin, as
            // soon as it reports success — idle must flip true here rather
            // than after the whole run resolves, or is_busy stays true (and
            // a pending task can't preempt) for the entire container
            // lifetime instead of just the active-reply portion of it.
            if event.is_success() {
                group_queue.notify_idle(&group_jid).await;
            }
        })
    });

    let group_queue_for_process = group_queue.clone();
    let group_jid_for_process = group.jid.clone();
    let group_folder_for_process = group.folder.clone();
    let on_process: crate::container_runner::OnProcessHook = Box::new(move |pid, name| {
        let group_queue = group_queue_for_process.clone();
        let group_jid = group_jid_for_process.clone();
        let handle = ContainerHandle::new(
            group_jid.clone(),
            Lane::Message,
            group_folder_for_process.clone(),
            name,
            pid,
        );
        tokio::spawn(async move {
            group_queue.set_message_handle(&group_jid, handle).await;
        });
    });

    let result = run_container_streaming(
        &input,
        &additional_mounts,
        Some(config.container_timeout),
        &HashMap::new(),
        config,
        db,
        on_process,
        on_output,
    )
    .await;

    match result {
        Ok(output) => output.is_success(),
        Err(e) => {
            error!(group_jid = %group.jid, error = %e, "Container run failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_tags_removes_span() {
        let text = "hello <internal>scratch notes</internal> world";
        assert_eq!(strip_internal_tags(text), "hello  world".trim());
    }

    #[test]
    fn strip_internal_tags_no_tag_passes_through() {
        assert_eq!(strip_internal_tags("plain text"), "plain text");
    }

    #[test]
    fn strip_internal_tags_multiline() {
        let text = "<internal>\nline one\nline two\n</internal>visible";
        assert_eq!(strip_internal_tags(text), "visible");
    }

    #[test]
    fn strip_internal_tags_multiple_spans() {
        let text = "a<internal>x</internal>b<internal>y</internal>c";
        assert_eq!(strip_internal_tags(text), "abc");
    }
}
