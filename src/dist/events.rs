//! The distributed control plane: named events with serialized payloads.
//!
//! All cross-node traffic is an [`Envelope`]: an event name, the target
//! object's UID, and a postcard-serialized state payload. Node 0 is the
//! control node; compute nodes are `1..=N`. There is no ordering guarantee
//! between unrelated event types, but each type is processed in broadcast
//! order (per-node FIFO channels give us that for free).

use crate::reduce::ReduceOp;
use crate::types::{EbbType, Value};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The canonical event set, plus the control node's read-back request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    NewRelation,
    GlobalGridPartition,
    RecordNewField,
    PrepareField,
    LoadFieldConstant,
    MarkGhostsReady,
    NewTask,
    LaunchTask,
    FetchField,
}

/// One control-plane message: event name, target UID, serialized state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub name: EventName,
    pub uid: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new<T: Serialize>(name: EventName, uid: u32, state: &T) -> Result<Self> {
        let payload = postcard::to_allocvec(state)
            .with_context(|| format!("serialize {name:?} payload"))?;
        Ok(Self { name, uid, payload })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        postcard::from_bytes(&self.payload)
            .with_context(|| format!("decode {:?} payload", self.name))
    }
}

/// Serialized state of a grid relation being announced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationState {
    pub name: String,
    pub dims: Vec<u64>,
    pub periodic: Vec<bool>,
}

/// Blocking for a relation's global grid partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionState {
    pub blocking: Vec<usize>,
}

/// A field being recorded on a relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldState {
    pub relation: u32,
    pub field: u32,
    pub name: String,
    pub ty: EbbType,
}

/// Which field a prepare / ghosts-ready / fetch event targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldTarget {
    pub relation: u32,
    pub field: u32,
}

/// A constant fill of one field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantState {
    pub relation: u32,
    pub field: u32,
    pub value: Value,
}

/// The access privilege a task declares on one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    ReadWrite,
    Reduce(ReduceOp),
}

/// A task announcement: its relation, and its ordered field accesses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    pub relation: u32,
    pub accesses: Vec<(u32, AccessKind)>,
}

/// A compute node's acknowledgement of one event.
#[derive(Clone, Debug)]
pub struct Ack {
    pub node: usize,
    pub name: EventName,
    pub uid: u32,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarKind;

    #[test]
    fn envelope_roundtrip() -> Result<()> {
        let state = FieldState {
            relation: 3,
            field: 1,
            name: "temperature".into(),
            ty: EbbType::scalar(ScalarKind::F64),
        };
        let env = Envelope::new(EventName::RecordNewField, 3, &state)?;
        let back: FieldState = env.decode()?;
        assert_eq!(back.name, "temperature");
        assert_eq!(back.ty, EbbType::scalar(ScalarKind::F64));
        Ok(())
    }

    #[test]
    fn wrong_payload_type_fails() -> Result<()> {
        let env = Envelope::new(EventName::LaunchTask, 7, &())?;
        assert!(env.decode::<FieldState>().is_err());
        Ok(())
    }
}
