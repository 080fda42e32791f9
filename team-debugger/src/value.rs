// Values and value nodes
//
// Value nodes form a tree (variable -> member -> pointee ...). They live in
// a container arena and reference their parent by id. Resolution fills in a
// node's location and value exactly once.

use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::error::{DebuggerError, DebuggerResult};
use crate::interface::TeamMemory;
use crate::types::TargetAddr;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub type ValueNodeId = u64;

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Integer { size: usize, signed: bool },
    Bool,
    Pointer { target: Box<ValueType> },
    Struct { name: String, size: usize },
    Array { element: Box<ValueType>, count: usize },
}

impl ValueType {
    pub fn size(&self, address_size: usize) -> usize {
        match self {
            ValueType::Integer { size, .. } => *size,
            ValueType::Bool => 1,
            ValueType::Pointer { .. } => address_size,
            ValueType::Struct { size, .. } => *size,
            ValueType::Array { element, count } => element.size(address_size) * count,
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, ValueType::Struct { .. } | ValueType::Array { .. })
    }

    pub fn name(&self) -> String {
        match self {
            ValueType::Integer { size, signed: true } => format!("int{}", size * 8),
            ValueType::Integer { size, signed: false } => format!("uint{}", size * 8),
            ValueType::Bool => "bool".to_string(),
            ValueType::Pointer { target } => format!("{}*", target.name()),
            ValueType::Struct { name, .. } => name.clone(),
            ValueType::Array { element, count } => format!("{}[{}]", element.name(), count),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Unsigned(u64),
    Bool(bool),
    Address(TargetAddr),
    /// Aggregate stored in target memory at `address`
    Compound { address: TargetAddr },
}

impl Value {
    /// Truthiness for primitive values; aggregates have none.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Integer(v) => Some(*v != 0),
            Value::Unsigned(v) => Some(*v != 0),
            Value::Bool(v) => Some(*v),
            Value::Address(v) => Some(*v != 0),
            Value::Compound { .. } => None,
        }
    }

    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(v) => Some(*v as u64),
            Value::Unsigned(v) | Value::Address(v) => Some(*v),
            Value::Bool(v) => Some(u64::from(*v)),
            Value::Compound { .. } => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Address(v) => write!(f, "{:#x}", v),
            Value::Compound { address } => write!(f, "{{...}} @ {:#x}", address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLocation {
    Memory { address: TargetAddr, size: usize },
    Register { index: usize, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueNodeKind {
    /// Root node; its location comes from debug info
    Variable { location: ValueLocation },
    Member { offset: u64 },
    Element { index: usize },
    Pointee,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Unresolved,
    Resolved(T),
    Failed(String),
}

impl<T> Resolution<T> {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Resolution::Unresolved)
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValueNode {
    pub id: ValueNodeId,
    pub name: String,
    pub parent: Option<ValueNodeId>,
    pub kind: ValueNodeKind,
    pub value_type: ValueType,
    location: Resolution<ValueLocation>,
    value: Resolution<(ValueLocation, Value)>,
}

impl ValueNode {
    /// Where this node sits relative to its parent.
    pub fn location_state(&self) -> &Resolution<ValueLocation> {
        &self.location
    }

    /// Final location and value of the node.
    pub fn value_state(&self) -> &Resolution<(ValueLocation, Value)> {
        &self.value
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.resolved().map(|(_, value)| value)
    }

    pub fn resolved_location(&self) -> Option<&ValueLocation> {
        self.value.resolved().map(|(location, _)| location)
    }
}

/// Arena of value nodes shared by the jobs that resolve them.
#[derive(Debug)]
pub struct ValueNodeContainer {
    id: u64,
    nodes: Mutex<BTreeMap<ValueNodeId, ValueNode>>,
    next_node_id: AtomicU64,
}

impl Default for ValueNodeContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueNodeContainer {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::SeqCst),
            nodes: Mutex::new(BTreeMap::new()),
            next_node_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Job subject unique across containers.
    pub fn job_subject(&self, node: ValueNodeId) -> u64 {
        (self.id << 32) | (node & 0xffff_ffff)
    }

    pub fn add_variable(&self, name: &str, value_type: ValueType, location: ValueLocation) -> ValueNodeId {
        let id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        self.nodes.lock().insert(
            id,
            ValueNode {
                id,
                name: name.to_string(),
                parent: None,
                kind: ValueNodeKind::Variable {
                    location: location.clone(),
                },
                value_type,
                location: Resolution::Resolved(location),
                value: Resolution::Unresolved,
            },
        );
        id
    }

    pub fn add_child(
        &self,
        parent: ValueNodeId,
        name: &str,
        kind: ValueNodeKind,
        value_type: ValueType,
    ) -> DebuggerResult<ValueNodeId> {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&parent) {
            return Err(DebuggerError::NotFound(format!("value node {}", parent)));
        }
        let id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        nodes.insert(
            id,
            ValueNode {
                id,
                name: name.to_string(),
                parent: Some(parent),
                kind,
                value_type,
                location: Resolution::Unresolved,
                value: Resolution::Unresolved,
            },
        );
        Ok(id)
    }

    pub fn node(&self, id: ValueNodeId) -> Option<ValueNode> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: ValueNodeId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub fn children(&self, id: ValueNodeId) -> Vec<ValueNodeId> {
        self.nodes
            .lock()
            .values()
            .filter(|n| n.parent == Some(id))
            .map(|n| n.id)
            .collect()
    }

    /// Removes a node and its descendants.
    pub fn remove(&self, id: ValueNodeId) {
        let mut pending = vec![id];
        let mut nodes = self.nodes.lock();
        while let Some(current) = pending.pop() {
            if nodes.remove(&current).is_some() {
                pending.extend(
                    nodes
                        .values()
                        .filter(|n| n.parent == Some(current))
                        .map(|n| n.id),
                );
            }
        }
    }

    /// Records the child location unless it was resolved meanwhile.
    pub(crate) fn set_location(&self, id: ValueNodeId, location: ValueLocation) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.location.is_unresolved() => {
                node.location = Resolution::Resolved(location);
                true
            }
            _ => false,
        }
    }

    /// Records location and value unless another resolution got there first.
    pub(crate) fn set_location_and_value(&self, id: ValueNodeId, location: ValueLocation, value: Value) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.value.is_unresolved() => {
                node.value = Resolution::Resolved((location, value));
                true
            }
            _ => false,
        }
    }

    /// Marks the node failed unless it already has an outcome.
    pub(crate) fn set_failed(&self, id: ValueNodeId, error: &DebuggerError) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&id) {
            Some(node) if node.value.is_unresolved() => {
                if node.location.is_unresolved() {
                    node.location = Resolution::Failed(error.to_string());
                }
                node.value = Resolution::Failed(error.to_string());
                true
            }
            _ => false,
        }
    }

    /// Replaces the value after a successful write to the target.
    pub(crate) fn replace_value(&self, id: ValueNodeId, location: ValueLocation, value: Value) {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.value = Resolution::Resolved((location, value));
        }
        self.invalidate_descendants(id);
    }

    fn invalidate_descendants(&self, id: ValueNodeId) {
        let mut nodes = self.nodes.lock();
        let mut pending: Vec<ValueNodeId> = nodes
            .values()
            .filter(|n| n.parent == Some(id))
            .map(|n| n.id)
            .collect();
        while let Some(current) = pending.pop() {
            if let Some(node) = nodes.get_mut(&current) {
                node.location = Resolution::Unresolved;
                node.value = Resolution::Unresolved;
            }
            pending.extend(
                nodes
                    .values()
                    .filter(|n| n.parent == Some(current))
                    .map(|n| n.id),
            );
        }
    }
}

/// Where a child node lives, given its parent's resolved value.
pub fn resolve_child_location(
    kind: &ValueNodeKind,
    parent_type: &ValueType,
    parent_value: &Value,
    child_type: &ValueType,
    address_size: usize,
) -> DebuggerResult<ValueLocation> {
    let size = child_type.size(address_size);
    match (kind, parent_value) {
        (ValueNodeKind::Variable { location }, _) => Ok(location.clone()),
        (ValueNodeKind::Member { offset }, Value::Compound { address }) => {
            if !matches!(parent_type, ValueType::Struct { .. }) {
                return Err(DebuggerError::Evaluation(format!(
                    "member of non-struct {}",
                    parent_type.name()
                )));
            }
            Ok(ValueLocation::Memory {
                address: address + offset,
                size,
            })
        }
        (ValueNodeKind::Element { index }, Value::Compound { address }) => match parent_type {
            ValueType::Array { count, .. } if index < count => Ok(ValueLocation::Memory {
                address: address + (*index * size) as TargetAddr,
                size,
            }),
            _ => Err(DebuggerError::Evaluation(format!(
                "element {} out of range for {}",
                index,
                parent_type.name()
            ))),
        },
        (ValueNodeKind::Pointee, Value::Address(0)) => Err(DebuggerError::BadAddress(0)),
        (ValueNodeKind::Pointee, Value::Address(address)) => Ok(ValueLocation::Memory {
            address: *address,
            size,
        }),
        _ => Err(DebuggerError::Evaluation(format!(
            "cannot derive child location from {}",
            parent_value
        ))),
    }
}

/// Loads and stores values according to the architecture's layout.
pub struct ValueLoader<'a> {
    architecture: &'a dyn Architecture,
    memory: &'a dyn TeamMemory,
    cpu_state: Option<&'a CpuState>,
}

impl<'a> ValueLoader<'a> {
    pub fn new(
        architecture: &'a dyn Architecture,
        memory: &'a dyn TeamMemory,
        cpu_state: Option<&'a CpuState>,
    ) -> Self {
        Self {
            architecture,
            memory,
            cpu_state,
        }
    }

    pub async fn load_value(&self, location: &ValueLocation, value_type: &ValueType) -> DebuggerResult<Value> {
        if value_type.is_compound() {
            return match location {
                ValueLocation::Memory { address, .. } => Ok(Value::Compound { address: *address }),
                ValueLocation::Register { .. } => Err(DebuggerError::Unsupported(
                    "aggregate in register".to_string(),
                )),
            };
        }

        let size = value_type.size(self.architecture.address_size());
        if size == 0 || size > 8 {
            return Err(DebuggerError::Unsupported(format!("{}-byte scalar", size)));
        }
        let raw = match location {
            ValueLocation::Memory { address, .. } => {
                let bytes = self.memory.read_memory(*address, size).await?;
                if bytes.len() < size {
                    return Err(DebuggerError::BadAddress(*address));
                }
                self.decode(&bytes, size)
            }
            ValueLocation::Register { index, .. } => {
                let cpu_state = self
                    .cpu_state
                    .ok_or_else(|| DebuggerError::InvalidState("no CPU state".to_string()))?;
                let value = cpu_state
                    .register(*index)
                    .ok_or_else(|| DebuggerError::NotFound(format!("register {}", index)))?;
                if size == 8 {
                    value
                } else {
                    value & ((1u64 << (size * 8)) - 1)
                }
            }
        };

        Ok(match value_type {
            ValueType::Integer { signed: true, .. } => {
                let shift = 64 - size * 8;
                Value::Integer(((raw << shift) as i64) >> shift)
            }
            ValueType::Integer { signed: false, .. } => Value::Unsigned(raw),
            ValueType::Bool => Value::Bool(raw != 0),
            _ => Value::Address(raw),
        })
    }

    /// Target byte representation of `value`.
    pub fn encode_value(&self, value: &Value, value_type: &ValueType) -> DebuggerResult<Vec<u8>> {
        if value_type.is_compound() {
            return Err(DebuggerError::Unsupported(format!(
                "writing {}",
                value_type.name()
            )));
        }
        let size = value_type.size(self.architecture.address_size());
        let raw = value
            .to_u64()
            .ok_or_else(|| DebuggerError::Evaluation(format!("cannot store {}", value)))?;
        let mut buf = BytesMut::with_capacity(size);
        if self.architecture.is_big_endian() {
            buf.put_uint(raw, size);
        } else {
            buf.put_uint_le(raw, size);
        }
        Ok(buf.to_vec())
    }

    fn decode(&self, bytes: &[u8], size: usize) -> u64 {
        let mut buf = &bytes[..size];
        if self.architecture.is_big_endian() {
            buf.get_uint(size)
        } else {
            buf.get_uint_le(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> ValueType {
        ValueType::Integer {
            size: 4,
            signed: true,
        }
    }

    #[test]
    fn test_child_location_member() {
        let parent_type = ValueType::Struct {
            name: "point".to_string(),
            size: 8,
        };
        let location = resolve_child_location(
            &ValueNodeKind::Member { offset: 4 },
            &parent_type,
            &Value::Compound { address: 0x2000 },
            &int32(),
            8,
        )
        .unwrap();
        assert_eq!(location, ValueLocation::Memory { address: 0x2004, size: 4 });
    }

    #[test]
    fn test_child_location_errors() {
        let array = ValueType::Array {
            element: Box::new(int32()),
            count: 2,
        };
        let out_of_range = resolve_child_location(
            &ValueNodeKind::Element { index: 2 },
            &array,
            &Value::Compound { address: 0x2000 },
            &int32(),
            8,
        );
        assert!(out_of_range.is_err());

        let null = resolve_child_location(
            &ValueNodeKind::Pointee,
            &ValueType::Pointer { target: Box::new(int32()) },
            &Value::Address(0),
            &int32(),
            8,
        );
        assert!(matches!(null, Err(DebuggerError::BadAddress(0))));
    }

    #[test]
    fn test_first_resolution_wins() {
        let container = ValueNodeContainer::new();
        let location = ValueLocation::Memory { address: 0x10, size: 4 };
        let id = container.add_variable("x", int32(), location.clone());

        assert!(container.set_location_and_value(id, location.clone(), Value::Integer(1)));
        assert!(!container.set_location_and_value(id, location, Value::Integer(2)));
        assert!(!container.set_failed(id, &DebuggerError::Aborted));
        assert_eq!(container.node(id).unwrap().value(), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_remove_drops_descendants() {
        let container = ValueNodeContainer::new();
        let root = container.add_variable(
            "p",
            ValueType::Struct { name: "s".to_string(), size: 8 },
            ValueLocation::Memory { address: 0x10, size: 8 },
        );
        let child = container
            .add_child(root, "a", ValueNodeKind::Member { offset: 0 }, int32())
            .unwrap();
        assert_eq!(container.children(root), vec![child]);

        container.remove(root);
        assert!(!container.contains(root));
        assert!(!container.contains(child));
        assert!(container
            .add_child(root, "b", ValueNodeKind::Member { offset: 4 }, int32())
            .is_err());
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(Value::Integer(0).to_bool(), Some(false));
        assert_eq!(Value::Unsigned(3).to_bool(), Some(true));
        assert_eq!(Value::Compound { address: 1 }.to_bool(), None);
    }
}
