use std::fmt;

use ep_types::{NodeId, PlaneError, TaskId};
use serde::{Deserialize, Serialize};

/// One message on a node's channel, in either direction.
///
/// `request_id == 0` marks an unsolicited message. Replies from a node echo
/// the id of the command they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: i64,
    pub code: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn event(code: MessageCode, payload: Vec<u8>) -> Self {
        Frame { request_id: 0, code: code.as_str().to_string(), payload }
    }
}

/// Closed set of message codes exchanged with nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    // server -> node
    ConnectedApiNode,
    NewNodeTask,
    ConfigChanged,
    CheckSystemdService,
    CheckLocalFirewall,
    ChangeApiNode,
    PurgeCache,
    PreheatCache,
    // node -> server
    TaskDone,
    Heartbeat,
}

/// Direction a code may travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToNode,
    FromNode,
}

const CODE_TABLE: &[(MessageCode, &str, Direction)] = &[
    (MessageCode::ConnectedApiNode, "connectedAPINode", Direction::ToNode),
    (MessageCode::NewNodeTask, "newNodeTask", Direction::ToNode),
    (MessageCode::ConfigChanged, "configChanged", Direction::ToNode),
    (MessageCode::CheckSystemdService, "checkSystemdService", Direction::ToNode),
    (MessageCode::CheckLocalFirewall, "checkLocalFirewall", Direction::ToNode),
    (MessageCode::ChangeApiNode, "changeAPINode", Direction::ToNode),
    (MessageCode::PurgeCache, "purgeCache", Direction::ToNode),
    (MessageCode::PreheatCache, "preheatCache", Direction::ToNode),
    (MessageCode::TaskDone, "taskDone", Direction::FromNode),
    (MessageCode::Heartbeat, "heartbeat", Direction::FromNode),
];

impl MessageCode {
    pub fn as_str(self) -> &'static str {
        Self::entry(self).1
    }

    pub fn direction(self) -> Direction {
        Self::entry(self).2
    }

    /// Codes an operator may send with `send_command`. Channel bookkeeping
    /// codes are excluded.
    pub fn is_command(self) -> bool {
        self.direction() == Direction::ToNode
            && !matches!(self, MessageCode::ConnectedApiNode | MessageCode::NewNodeTask)
    }

    pub fn parse(code: &str) -> Result<Self, PlaneError> {
        CODE_TABLE
            .iter()
            .find(|(_, s, _)| *s == code)
            .map(|(c, _, _)| *c)
            .ok_or_else(|| PlaneError::Protocol(format!("unknown message code: {code:?}")))
    }

    fn entry(self) -> &'static (MessageCode, &'static str, Direction) {
        // Every variant has exactly one row; covered by the table test.
        CODE_TABLE
            .iter()
            .find(|(c, _, _)| *c == self)
            .unwrap_or(&CODE_TABLE[0])
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the first frame sent on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub instance_id: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDonePayload {
    pub task_id: TaskId,
    pub is_ok: bool,
    #[serde(default)]
    pub error: String,
}

/// Unsolicited messages a node can raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    TaskDone { task_id: TaskId, is_ok: bool, error: String },
    Heartbeat,
}

impl NodeEvent {
    pub fn decode(frame: &Frame) -> Result<Self, PlaneError> {
        match MessageCode::parse(&frame.code)? {
            MessageCode::TaskDone => {
                let p: TaskDonePayload = serde_json::from_slice(&frame.payload)
                    .map_err(|e| PlaneError::Protocol(format!("bad taskDone payload: {e}")))?;
                Ok(NodeEvent::TaskDone { task_id: p.task_id, is_ok: p.is_ok, error: p.error })
            }
            MessageCode::Heartbeat => Ok(NodeEvent::Heartbeat),
            other => Err(PlaneError::Protocol(format!("{other} is not a node event"))),
        }
    }
}
