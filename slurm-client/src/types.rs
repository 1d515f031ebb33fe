//! Slurm node records as reported by slurmrestd.

use serde::{Deserialize, Serialize};

/// Base state of a Slurm node. Exactly one is reported per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeBaseState {
    /// Node has all of its resources allocated.
    Allocated,
    /// Node is unavailable for use.
    Down,
    /// Node is in an error state.
    Error,
    /// Node is defined for future use.
    Future,
    /// Node is available and has no jobs.
    Idle,
    /// Node has some of its resources allocated.
    Mixed,
    /// State could not be determined.
    Unknown,
}

/// Flags that can accompany the base state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeStateFlag {
    /// Jobs are completing on the node.
    Completing,
    /// Node is draining or drained.
    Drain,
    /// Node is failing.
    Fail,
    /// Node registered with an invalid configuration.
    Invalid,
    /// Node is in a maintenance reservation.
    Maintenance,
    /// Node is not responding to slurmctld.
    NotResponding,
    /// Node is powered down.
    PoweredDown,
    /// Node is in an advanced reservation.
    Reserved,
    /// Node was requested to be undrained.
    Undrain,
    /// Any flag this client does not model.
    Other(String),
}

/// Parsed form of the `state` array of a node record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    /// Base state.
    pub base: NodeBaseState,
    /// Additional flags.
    pub flags: Vec<NodeStateFlag>,
}

impl NodeState {
    /// Parse the raw state strings returned by slurmrestd.
    ///
    /// The first recognised base state wins; everything else is a flag.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut base = None;
        let mut flags = Vec::new();

        for item in raw {
            let item = item.as_ref().to_ascii_uppercase();
            let parsed_base = match item.as_str() {
                "ALLOCATED" => Some(NodeBaseState::Allocated),
                "DOWN" => Some(NodeBaseState::Down),
                "ERROR" => Some(NodeBaseState::Error),
                "FUTURE" => Some(NodeBaseState::Future),
                "IDLE" => Some(NodeBaseState::Idle),
                "MIXED" => Some(NodeBaseState::Mixed),
                "UNKNOWN" => Some(NodeBaseState::Unknown),
                _ => None,
            };
            match parsed_base {
                Some(state) if base.is_none() => base = Some(state),
                Some(_) => {}
                None => flags.push(match item.as_str() {
                    "COMPLETING" => NodeStateFlag::Completing,
                    "DRAIN" => NodeStateFlag::Drain,
                    "FAIL" => NodeStateFlag::Fail,
                    "INVALID" | "INVALID_REG" => NodeStateFlag::Invalid,
                    "MAINTENANCE" => NodeStateFlag::Maintenance,
                    "NOT_RESPONDING" => NodeStateFlag::NotResponding,
                    "POWERED_DOWN" => NodeStateFlag::PoweredDown,
                    "RESERVED" => NodeStateFlag::Reserved,
                    "UNDRAIN" => NodeStateFlag::Undrain,
                    _ => NodeStateFlag::Other(item),
                }),
            }
        }

        Self {
            base: base.unwrap_or(NodeBaseState::Unknown),
            flags,
        }
    }

    /// Whether the given flag is set.
    pub fn has_flag(&self, flag: &NodeStateFlag) -> bool {
        self.flags.contains(flag)
    }

    /// Whether the node is running or about to run jobs.
    pub fn is_busy(&self) -> bool {
        matches!(self.base, NodeBaseState::Allocated | NodeBaseState::Mixed)
            || self.has_flag(&NodeStateFlag::Completing)
    }
}

/// A Slurm node record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Slurm node name.
    pub name: String,

    /// Raw node state strings, e.g. `["IDLE", "DRAIN"]`.
    #[serde(default)]
    pub state: Vec<String>,

    /// Reason set by an administrator or by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Node address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Node {
    /// Create a node record with the given state strings.
    pub fn new(name: impl Into<String>, state: &[&str]) -> Self {
        Self {
            name: name.into(),
            state: state.iter().map(|s| s.to_string()).collect(),
            reason: None,
            comment: None,
            address: None,
        }
    }

    /// Parsed node state.
    pub fn node_state(&self) -> NodeState {
        NodeState::parse(&self.state)
    }
}

/// Body of a node update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    /// New state strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<String>,

    /// Reason for the state change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NodeUpdate {
    /// Drain the node with a reason.
    pub fn drain(reason: impl Into<String>) -> Self {
        Self {
            state: vec!["DRAIN".to_string()],
            reason: Some(reason.into()),
        }
    }

    /// Return a drained node to service.
    pub fn undrain() -> Self {
        Self {
            state: vec!["UNDRAIN".to_string()],
            reason: None,
        }
    }
}

/// Envelope returned by the node endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct NodesResponse {
    #[serde(default)]
    pub nodes: Vec<Node>,
}
