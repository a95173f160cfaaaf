//! Binary format for cluster tasks.
//!
//! Format:
//! ```text
//! [version: u8]
//! [tag: u8]
//! node tasks:          [node_id][service_id]
//! subscription tasks:  node fields, [subscription_id][owner][jid][state]
//! affiliation task:    node fields, [jid][affiliation]
//! flush task:          [has_node: u8] then node fields when has_node == 1
//! ```
//! Every string is `[len: u32 BE][utf-8 bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use jid::{BareJid, Jid};

use crate::affiliation::Affiliation;
use crate::subscription::SubscriptionState;

use super::{ClusterTask, TaskNode, TaskSubscription};

/// Current task format version.
pub const TASK_FORMAT_VERSION: u8 = 1;

const TAG_AFFILIATION: u8 = 1;
const TAG_NEW_SUBSCRIPTION: u8 = 2;
const TAG_MODIFY_SUBSCRIPTION: u8 = 3;
const TAG_CANCEL_SUBSCRIPTION: u8 = 4;
const TAG_REFRESH_NODE: u8 = 5;
const TAG_REMOVE_NODE: u8 = 6;
const TAG_FLUSH: u8 = 7;

/// Errors decoding a cluster task.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Written by a member speaking another format version.
    #[error("Unsupported task format version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown task tag.
    #[error("Unknown task tag: {0}")]
    UnknownTag(u8),

    /// Input ended early.
    #[error("Truncated task")]
    Truncated,

    /// String field is not UTF-8.
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// JID field does not parse.
    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    /// Enum field or trailer is invalid.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Serialize a task.
pub fn encode_task(task: &ClusterTask) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(TASK_FORMAT_VERSION);

    match task {
        ClusterTask::Affiliation {
            node,
            jid,
            affiliation,
        } => {
            buf.put_u8(TAG_AFFILIATION);
            put_node(&mut buf, node);
            put_str(&mut buf, &jid.to_string());
            put_str(&mut buf, affiliation.as_str());
        }
        ClusterTask::NewSubscription(subscription) => {
            buf.put_u8(TAG_NEW_SUBSCRIPTION);
            put_subscription(&mut buf, subscription);
        }
        ClusterTask::ModifySubscription(subscription) => {
            buf.put_u8(TAG_MODIFY_SUBSCRIPTION);
            put_subscription(&mut buf, subscription);
        }
        ClusterTask::CancelSubscription(subscription) => {
            buf.put_u8(TAG_CANCEL_SUBSCRIPTION);
            put_subscription(&mut buf, subscription);
        }
        ClusterTask::RefreshNode(node) => {
            buf.put_u8(TAG_REFRESH_NODE);
            put_node(&mut buf, node);
        }
        ClusterTask::RemoveNode(node) => {
            buf.put_u8(TAG_REMOVE_NODE);
            put_node(&mut buf, node);
        }
        ClusterTask::Flush { node } => {
            buf.put_u8(TAG_FLUSH);
            match node {
                Some(node) => {
                    buf.put_u8(1);
                    put_node(&mut buf, node);
                }
                None => buf.put_u8(0),
            }
        }
    }

    buf.freeze()
}

/// Deserialize a task.
pub fn decode_task(data: &[u8]) -> Result<ClusterTask, CodecError> {
    let mut buf = data;

    let version = get_u8(&mut buf)?;
    if version != TASK_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let task = match get_u8(&mut buf)? {
        TAG_AFFILIATION => {
            let node = get_node(&mut buf)?;
            let jid = get_bare_jid(&mut buf)?;
            let affiliation = get_str(&mut buf)?;
            let affiliation = Affiliation::from_str(&affiliation)
                .ok_or_else(|| CodecError::InvalidValue(format!("affiliation {affiliation}")))?;
            ClusterTask::Affiliation {
                node,
                jid,
                affiliation,
            }
        }
        TAG_NEW_SUBSCRIPTION => ClusterTask::NewSubscription(get_subscription(&mut buf)?),
        TAG_MODIFY_SUBSCRIPTION => ClusterTask::ModifySubscription(get_subscription(&mut buf)?),
        TAG_CANCEL_SUBSCRIPTION => ClusterTask::CancelSubscription(get_subscription(&mut buf)?),
        TAG_REFRESH_NODE => ClusterTask::RefreshNode(get_node(&mut buf)?),
        TAG_REMOVE_NODE => ClusterTask::RemoveNode(get_node(&mut buf)?),
        TAG_FLUSH => {
            let node = match get_u8(&mut buf)? {
                0 => None,
                1 => Some(get_node(&mut buf)?),
                other => {
                    return Err(CodecError::InvalidValue(format!("flush node marker {other}")))
                }
            };
            ClusterTask::Flush { node }
        }
        tag => return Err(CodecError::UnknownTag(tag)),
    };

    if buf.has_remaining() {
        return Err(CodecError::InvalidValue(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(task)
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_node(buf: &mut BytesMut, node: &TaskNode) {
    put_str(buf, &node.node_id);
    put_str(buf, &node.service_id);
}

fn put_subscription(buf: &mut BytesMut, subscription: &TaskSubscription) {
    put_node(buf, &subscription.node);
    put_str(buf, &subscription.subscription_id);
    put_str(buf, &subscription.owner.to_string());
    put_str(buf, &subscription.jid.to_string());
    put_str(buf, subscription.state.as_str());
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn get_node(buf: &mut &[u8]) -> Result<TaskNode, CodecError> {
    let node_id = get_str(buf)?;
    let service_id = get_str(buf)?;
    Ok(TaskNode {
        service_id,
        node_id,
    })
}

fn get_bare_jid(buf: &mut &[u8]) -> Result<BareJid, CodecError> {
    let raw = get_str(buf)?;
    raw.parse()
        .map_err(|e| CodecError::InvalidJid(format!("{raw}: {e}")))
}

fn get_subscription(buf: &mut &[u8]) -> Result<TaskSubscription, CodecError> {
    let node = get_node(buf)?;
    let subscription_id = get_str(buf)?;
    let owner = get_bare_jid(buf)?;
    let raw = get_str(buf)?;
    let jid: Jid = raw
        .parse()
        .map_err(|e| CodecError::InvalidJid(format!("{raw}: {e}")))?;
    let state = get_str(buf)?;
    let state = SubscriptionState::from_str(&state)
        .ok_or_else(|| CodecError::InvalidValue(format!("subscription state {state}")))?;
    Ok(TaskSubscription {
        node,
        subscription_id,
        owner,
        jid,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(service_id: &str) -> TaskSubscription {
        TaskSubscription {
            node: TaskNode::new(service_id, "princely_musings"),
            subscription_id: "ba49252aaa4f5d320c24d3766f0bdcade78c78d3".to_string(),
            owner: "francisco@denmark.lit".parse().expect("valid jid"),
            jid: "francisco@denmark.lit/barracks".parse().expect("valid jid"),
            state: SubscriptionState::Unconfigured,
        }
    }

    #[test]
    fn test_every_variant_survives_encoding() {
        let node = TaskNode::new("pubsub", "princely_musings");
        let tasks = vec![
            ClusterTask::Affiliation {
                node: node.clone(),
                jid: "hamlet@denmark.lit".parse().expect("valid jid"),
                affiliation: Affiliation::Outcast,
            },
            ClusterTask::NewSubscription(subscription("pubsub")),
            ClusterTask::ModifySubscription(subscription("hamlet@denmark.lit")),
            ClusterTask::CancelSubscription(subscription("pubsub")),
            ClusterTask::RefreshNode(node.clone()),
            ClusterTask::RemoveNode(TaskNode::new("hamlet@denmark.lit", "ünïcode/node")),
            ClusterTask::Flush { node: None },
            ClusterTask::Flush { node: Some(node) },
        ];

        for task in tasks {
            let bytes = encode_task(&task);
            assert_eq!(decode_task(&bytes).expect("decode"), task, "{}", task.kind());
        }
    }

    #[test]
    fn test_node_fields_are_node_then_service() {
        let bytes = encode_task(&ClusterTask::RemoveNode(TaskNode::new("pubsub", "n")));
        assert_eq!(
            bytes.as_ref(),
            &[
                TASK_FORMAT_VERSION,
                TAG_REMOVE_NODE,
                0,
                0,
                0,
                1,
                b'n',
                0,
                0,
                0,
                6,
                b'p',
                b'u',
                b'b',
                b's',
                b'u',
                b'b'
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_version_and_tag() {
        assert!(matches!(
            decode_task(&[9, TAG_FLUSH, 0]),
            Err(CodecError::UnsupportedVersion(9))
        ));
        assert!(matches!(
            decode_task(&[TASK_FORMAT_VERSION, 42]),
            Err(CodecError::UnknownTag(42))
        ));
    }

    #[test]
    fn test_rejects_truncated_input() {
        let bytes = encode_task(&ClusterTask::NewSubscription(subscription("pubsub")));
        for len in [0, 1, 2, 5, bytes.len() - 1] {
            assert!(
                matches!(decode_task(&bytes[..len]), Err(CodecError::Truncated)),
                "length {len}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_enum_value() {
        let mut buf = BytesMut::new();
        buf.put_u8(TASK_FORMAT_VERSION);
        buf.put_u8(TAG_AFFILIATION);
        put_node(&mut buf, &TaskNode::new("pubsub", "n"));
        put_str(&mut buf, "a@example.com");
        put_str(&mut buf, "emperor");
        assert!(matches!(
            decode_task(&buf),
            Err(CodecError::InvalidValue(_))
        ));
    }
}
