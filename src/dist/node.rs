//! The in-process multi-node harness: a control handle plus compute-node
//! worker threads.
//!
//! Real transport is an external collaborator; here compute nodes are
//! threads connected to the control node by FIFO channels, which preserves
//! the control plane's per-type broadcast ordering. Each compute node owns
//! a block-local shard of every partitioned field, a signal-graph
//! [`Scheduler`], and the ghost channels of its block.
//!
//! Task bodies are host functions shared through a registry (the control
//! plane ships only the task's access metadata); a launched task runs on
//! the node's worker behind the per-field signal discipline, with a ghost
//! exchange for every accessed field that has channels.

use crate::config::Config;
use crate::dist::events::{
    Ack, AccessKind, ConstantState, Envelope, EventName, FieldState, FieldTarget, PartitionState,
    RelationState, TaskState,
};
use crate::dist::ghost::{ChannelTable, GhostChannels};
use crate::dist::partition::{BlockBounds, GridPartition, grid_partition};
use crate::error::Error;
use crate::layout::Privilege;
use crate::sched::{FieldSignals, Scheduler};
use crate::types::{EbbType, Value};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A task body: runs on a compute node's worker against the block-local
/// shards of the fields it declared.
pub type TaskFn = Arc<dyn Fn(&mut TaskCtx) -> Result<()> + Send + Sync>;

type TaskRegistry = Arc<Mutex<HashMap<u32, TaskFn>>>;

/// Block-local view of one accessed field during a task.
pub struct TaskField {
    pub name: String,
    pub ty: EbbType,
    pub elem: usize,
    pub access: AccessKind,
    /// Row-major over the block extent.
    pub bytes: Vec<u8>,
    /// Mirrored neighbor strips keyed by ghost id.
    pub outer: HashMap<usize, Vec<u8>>,
    pub ghosts: Option<Arc<GhostChannels>>,
}

impl TaskField {
    /// Read a cell by global grid coordinates: the block itself, or a
    /// mirrored neighbor strip.
    pub fn read(&self, block: &BlockBounds, coords: &[u64]) -> Result<Value> {
        if block.contains(coords) {
            let off = crate::dist::ghost::block_linear(block, coords) * self.elem;
            return Value::decode(&self.ty, &self.bytes[off..off + self.elem]);
        }
        let ghosts = self
            .ghosts
            .as_ref()
            .ok_or_else(|| anyhow!("cell outside the block and no ghost channels"))?;
        let raw = ghosts
            .read_outer(&self.outer, coords)
            .ok_or_else(|| anyhow!("cell {coords:?} not covered by any ghost strip"))?;
        Value::decode(&self.ty, &raw)
    }

    /// Write a block-owned cell by global grid coordinates.
    pub fn write(&mut self, block: &BlockBounds, coords: &[u64], v: &Value) -> Result<()> {
        let off = crate::dist::ghost::block_linear(block, coords) * self.elem;
        let enc = v.encode(&self.ty);
        self.bytes[off..off + self.elem].copy_from_slice(&enc);
        Ok(())
    }
}

/// What a task body sees: its node, its block, and the accessed fields in
/// declaration order.
pub struct TaskCtx {
    pub node: usize,
    pub dims: Vec<u64>,
    pub block: BlockBounds,
    pub fields: Vec<TaskField>,
}

impl TaskCtx {
    pub fn field(&self, name: &str) -> Option<&TaskField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut TaskField> {
        self.fields.iter_mut().find(|f| f.name == name)
    }
}

enum ControlMsg {
    Event(Envelope),
    Shutdown,
}

struct NodeField {
    name: String,
    ty: EbbType,
    elem: usize,
    bytes: Vec<u8>,
    outer: HashMap<usize, Vec<u8>>,
    ghosts: Option<Arc<GhostChannels>>,
    signals: FieldSignals,
    ready: bool,
}

struct NodeRelation {
    dims: Vec<u64>,
    periodic: Vec<bool>,
    partition: Option<GridPartition>,
    block: Option<BlockBounds>,
    fields: HashMap<u32, NodeField>,
}

struct NodeState {
    node: usize,
    ghost_depth: u64,
    sched: Scheduler,
    table: Arc<ChannelTable>,
    registry: TaskRegistry,
    relations: HashMap<u32, NodeRelation>,
    tasks: HashMap<u32, TaskState>,
}

/// The control node's handle over an in-process cluster.
pub struct Cluster {
    txs: Vec<Sender<ControlMsg>>,
    ack_rx: Receiver<Ack>,
    handles: Vec<JoinHandle<()>>,
    registry: TaskRegistry,
    n_compute: usize,
    next_relation: u32,
    next_field: u32,
    next_task: u32,
}

impl Cluster {
    /// Spin up `config.num_partitions` compute nodes (nodes `1..=N`; the
    /// caller is node 0). The configuration must have the distributed
    /// runtime enabled; the mode is fixed at startup and never re-read.
    pub fn launch(config: &Config) -> Result<Cluster> {
        if config.mode != crate::config::RuntimeMode::Distributed {
            return Err(anyhow!(Error::Protocol(
                "the distributed scheduler is not enabled in this configuration".into()
            )));
        }
        let n_compute = config.num_partitions.max(1);
        let table = Arc::new(ChannelTable::new());
        let registry: TaskRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (ack_tx, ack_rx) = unbounded::<Ack>();
        let mut txs = Vec::with_capacity(n_compute);
        let mut handles = Vec::with_capacity(n_compute);
        for node in 1..=n_compute {
            let (tx, rx) = unbounded::<ControlMsg>();
            let table = Arc::clone(&table);
            let registry = Arc::clone(&registry);
            let ack_tx = ack_tx.clone();
            let depth = config.ghost_depth as u64;
            let handle = std::thread::Builder::new()
                .name(format!("meshflow-node-{node}"))
                .spawn(move || {
                    let mut state = NodeState {
                        node,
                        ghost_depth: depth,
                        sched: Scheduler::new(1),
                        table,
                        registry,
                        relations: HashMap::new(),
                        tasks: HashMap::new(),
                    };
                    for msg in rx {
                        match msg {
                            ControlMsg::Shutdown => break,
                            ControlMsg::Event(env) => {
                                let name = env.name;
                                let uid = env.uid;
                                match handle_event(&mut state, env) {
                                    Ok(payload) => {
                                        let _ = ack_tx.send(Ack { node, name, uid, payload });
                                    }
                                    Err(e) => {
                                        // protocol errors are fatal to this node
                                        tracing::error!(node, ?name, error = %e, "event failed");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                })
                .expect("compute node spawn");
            txs.push(tx);
            handles.push(handle);
        }
        Ok(Cluster {
            txs,
            ack_rx,
            handles,
            registry,
            n_compute,
            next_relation: 0,
            next_field: 0,
            next_task: 0,
        })
    }

    pub fn compute_nodes(&self) -> usize {
        self.n_compute
    }

    fn broadcast(&self, env: Envelope) {
        for tx in &self.txs {
            let _ = tx.send(ControlMsg::Event(env.clone()));
        }
    }

    /// Cooperative poll for one ack per compute node of the given type.
    fn await_acks(&self, name: EventName, uid: u32) -> Result<Vec<Ack>> {
        let mut acks = Vec::with_capacity(self.n_compute);
        while acks.len() < self.n_compute {
            match self.ack_rx.recv_timeout(Duration::from_secs(30)) {
                Ok(ack) if ack.name == name && ack.uid == uid => acks.push(ack),
                Ok(_) => continue,
                Err(_) => {
                    return Err(anyhow!(Error::Protocol(format!(
                        "timed out waiting for {name:?} acknowledgements"
                    ))));
                }
            }
        }
        acks.sort_by_key(|a| a.node);
        Ok(acks)
    }

    /// Announce a grid relation to every compute node.
    pub fn new_relation(&mut self, name: &str, dims: &[u64], periodic: &[bool]) -> Result<u32> {
        let uid = self.next_relation;
        self.next_relation += 1;
        let state = RelationState {
            name: name.to_string(),
            dims: dims.to_vec(),
            periodic: periodic.to_vec(),
        };
        self.broadcast(Envelope::new(EventName::NewRelation, uid, &state)?);
        self.await_acks(EventName::NewRelation, uid)?;
        Ok(uid)
    }

    /// Partition a relation over the fleet.
    pub fn partition(&self, relation: u32, blocking: &[usize]) -> Result<()> {
        let state = PartitionState { blocking: blocking.to_vec() };
        self.broadcast(Envelope::new(EventName::GlobalGridPartition, relation, &state)?);
        self.await_acks(EventName::GlobalGridPartition, relation)?;
        Ok(())
    }

    /// Record a new field on a partitioned relation.
    pub fn new_field(&mut self, relation: u32, name: &str, ty: EbbType) -> Result<u32> {
        let field = self.next_field;
        self.next_field += 1;
        let state = FieldState { relation, field, name: name.to_string(), ty };
        self.broadcast(Envelope::new(EventName::RecordNewField, relation, &state)?);
        self.await_acks(EventName::RecordNewField, relation)?;
        Ok(field)
    }

    /// Allocate block shards and construct ghost channels, then spin until
    /// every created channel on every node has reported done before marking
    /// the field ready for read-write launches.
    pub fn prepare_field(&self, relation: u32, field: u32) -> Result<()> {
        let target = FieldTarget { relation, field };
        self.broadcast(Envelope::new(EventName::PrepareField, relation, &target)?);
        let acks = self.await_acks(EventName::PrepareField, relation)?;
        // per-field readiness counter: each ack reports that node's channel
        // count; all nodes reporting is the ready condition
        let channels: usize = acks
            .iter()
            .map(|a| a.payload.first().copied().unwrap_or(0) as usize)
            .sum();
        tracing::debug!(relation, field, channels, "ghost channels constructed");
        self.broadcast(Envelope::new(EventName::MarkGhostsReady, relation, &target)?);
        self.await_acks(EventName::MarkGhostsReady, relation)?;
        Ok(())
    }

    /// Fill a field shard with one value on every node.
    pub fn load_constant(&self, relation: u32, field: u32, value: Value) -> Result<()> {
        let state = ConstantState { relation, field, value };
        self.broadcast(Envelope::new(EventName::LoadFieldConstant, relation, &state)?);
        self.await_acks(EventName::LoadFieldConstant, relation)?;
        Ok(())
    }

    /// Register a task: access metadata travels the control plane, the body
    /// goes into the shared registry.
    pub fn define_task(
        &mut self,
        name: &str,
        relation: u32,
        accesses: Vec<(u32, AccessKind)>,
        body: TaskFn,
    ) -> Result<u32> {
        let uid = self.next_task;
        self.next_task += 1;
        self.registry.lock().unwrap().insert(uid, body);
        let state = TaskState { name: name.to_string(), relation, accesses };
        self.broadcast(Envelope::new(EventName::NewTask, uid, &state)?);
        self.await_acks(EventName::NewTask, uid)?;
        Ok(uid)
    }

    /// Launch a registered task on every compute node.
    pub fn launch_task(&self, task: u32) -> Result<()> {
        self.broadcast(Envelope::new(EventName::LaunchTask, task, &())?);
        self.await_acks(EventName::LaunchTask, task)?;
        Ok(())
    }

    /// Read back one node's block shard of a field (row-major block bytes).
    pub fn fetch_field(&self, relation: u32, field: u32, node: usize) -> Result<Vec<u8>> {
        let target = FieldTarget { relation, field };
        self.broadcast(Envelope::new(EventName::FetchField, relation, &target)?);
        let acks = self.await_acks(EventName::FetchField, relation)?;
        acks.into_iter()
            .find(|a| a.node == node)
            .map(|a| a.payload)
            .ok_or_else(|| anyhow!("node {node} did not answer the fetch"))
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for tx in &self.txs {
            let _ = tx.send(ControlMsg::Shutdown);
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn access_privilege(a: AccessKind) -> Privilege {
    match a {
        AccessKind::Read => Privilege::ReadOnly,
        AccessKind::ReadWrite => Privilege::ReadWrite,
        AccessKind::Reduce(op) => Privilege::Reduce(op),
    }
}

fn handle_event(state: &mut NodeState, env: Envelope) -> Result<Vec<u8>> {
    match env.name {
        EventName::NewRelation => {
            let rs: RelationState = env.decode()?;
            state.relations.insert(env.uid, NodeRelation {
                dims: rs.dims,
                periodic: rs.periodic,
                partition: None,
                block: None,
                fields: HashMap::new(),
            });
            Ok(Vec::new())
        }
        EventName::GlobalGridPartition => {
            let ps: PartitionState = env.decode()?;
            let n_nodes = ps.blocking.iter().product::<usize>();
            let rel = state
                .relations
                .get_mut(&env.uid)
                .ok_or_else(|| anyhow!("unknown relation {}", env.uid))?;
            let partition = grid_partition(&rel.dims, &ps.blocking, n_nodes)?;
            rel.block = partition.block_of_node(state.node).cloned();
            rel.partition = Some(partition);
            Ok(Vec::new())
        }
        EventName::RecordNewField => {
            let fs: FieldState = env.decode()?;
            let rel = state
                .relations
                .get_mut(&fs.relation)
                .ok_or_else(|| anyhow!("unknown relation {}", fs.relation))?;
            let elem = fs.ty.size_of();
            rel.fields.insert(fs.field, NodeField {
                name: fs.name,
                ty: fs.ty,
                elem,
                bytes: Vec::new(),
                outer: HashMap::new(),
                ghosts: None,
                signals: state.sched.field_signals(),
                ready: false,
            });
            Ok(Vec::new())
        }
        EventName::PrepareField => {
            let t: FieldTarget = env.decode()?;
            let node = state.node;
            let depth = state.ghost_depth;
            let rel = state
                .relations
                .get_mut(&t.relation)
                .ok_or_else(|| anyhow!("unknown relation {}", t.relation))?;
            let partition = rel
                .partition
                .as_ref()
                .ok_or_else(|| anyhow!("relation {} is not partitioned", t.relation))?;
            let block = rel
                .block
                .as_ref()
                .ok_or_else(|| anyhow!("node owns no block"))?;
            let periodic = rel.periodic.clone();
            let field = rel
                .fields
                .get_mut(&t.field)
                .ok_or_else(|| anyhow!("unknown field {}", t.field))?;
            field.bytes = vec![0u8; block.cell_count() as usize * field.elem];
            let hid_base = (u64::from(t.relation) << 32) | u64::from(t.field);
            let ghosts = GhostChannels::build(
                &state.table,
                hid_base,
                node,
                partition,
                &periodic,
                depth,
                field.elem,
            )?;
            let links = ghosts.link_count() as u8;
            field.ghosts = Some(Arc::new(ghosts));
            Ok(vec![links])
        }
        EventName::LoadFieldConstant => {
            let cs: ConstantState = env.decode()?;
            let rel = state
                .relations
                .get_mut(&cs.relation)
                .ok_or_else(|| anyhow!("unknown relation {}", cs.relation))?;
            let field = rel
                .fields
                .get_mut(&cs.field)
                .ok_or_else(|| anyhow!("unknown field {}", cs.field))?;
            let v = cs
                .value
                .widen_to(&field.ty)
                .ok_or_else(|| anyhow!("constant does not fit the field type"))?;
            let enc = v.encode(&field.ty);
            for cell in field.bytes.chunks_mut(field.elem) {
                cell.copy_from_slice(&enc);
            }
            Ok(Vec::new())
        }
        EventName::MarkGhostsReady => {
            let t: FieldTarget = env.decode()?;
            let rel = state
                .relations
                .get_mut(&t.relation)
                .ok_or_else(|| anyhow!("unknown relation {}", t.relation))?;
            let field = rel
                .fields
                .get_mut(&t.field)
                .ok_or_else(|| anyhow!("unknown field {}", t.field))?;
            field.ready = true;
            Ok(Vec::new())
        }
        EventName::NewTask => {
            let ts: TaskState = env.decode()?;
            state.tasks.insert(env.uid, ts);
            Ok(Vec::new())
        }
        EventName::LaunchTask => run_task(state, env.uid).map(|()| Vec::new()),
        EventName::FetchField => {
            let t: FieldTarget = env.decode()?;
            let rel = state
                .relations
                .get(&t.relation)
                .ok_or_else(|| anyhow!("unknown relation {}", t.relation))?;
            let field = rel
                .fields
                .get(&t.field)
                .ok_or_else(|| anyhow!("unknown field {}", t.field))?;
            Ok(field.bytes.clone())
        }
    }
}

/// Execute one launched task behind the signal discipline: collect inputs,
/// move the accessed shards into a [`TaskCtx`], run the body (with a ghost
/// exchange per channeled field) on the node's worker, then settle the
/// field signals and move the shards back.
fn run_task(state: &mut NodeState, task: u32) -> Result<()> {
    let ts = state
        .tasks
        .get(&task)
        .ok_or_else(|| anyhow!("unknown task {task}"))?
        .clone();
    let body = state
        .registry
        .lock()
        .unwrap()
        .get(&task)
        .cloned()
        .ok_or_else(|| anyhow!("task {task} has no registered body"))?;

    let rel = state
        .relations
        .get_mut(&ts.relation)
        .ok_or_else(|| anyhow!("unknown relation {}", ts.relation))?;
    let block = rel
        .block
        .clone()
        .ok_or_else(|| anyhow!("node owns no block"))?;
    let dims = rel.dims.clone();

    // readiness gate: RW launches wait for ghost channels everywhere
    for (fid, access) in &ts.accesses {
        let f = rel
            .fields
            .get(fid)
            .ok_or_else(|| anyhow!("unknown field {fid}"))?;
        if matches!(access, AccessKind::ReadWrite) && f.ghosts.is_some() && !f.ready {
            return Err(anyhow!(Error::Protocol(format!(
                "field `{}` launched read-write before ghosts were ready",
                f.name
            ))));
        }
    }

    // collect inputs per the discipline and check the shards out
    let mut inputs = Vec::with_capacity(ts.accesses.len());
    let mut task_fields = Vec::with_capacity(ts.accesses.len());
    for (fid, access) in &ts.accesses {
        let f = rel.fields.get_mut(fid).expect("checked above");
        inputs.push(state.sched.acquire(&mut f.signals, access_privilege(*access)));
        task_fields.push(TaskField {
            name: f.name.clone(),
            ty: f.ty.clone(),
            elem: f.elem,
            access: *access,
            bytes: std::mem::take(&mut f.bytes),
            outer: std::mem::take(&mut f.outer),
            ghosts: f.ghosts.clone(),
        });
    }
    let input = state.sched.merge(&inputs);

    let ctx = Arc::new(Mutex::new(Some(TaskCtx {
        node: state.node,
        dims,
        block,
        fields: task_fields,
    })));
    let ctx_in = Arc::clone(&ctx);
    let result: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
    let result_in = Arc::clone(&result);

    let done = state.sched.exec(
        input,
        0,
        Box::new(move || {
            let mut guard = ctx_in.lock().unwrap();
            let ctx = guard.as_mut().expect("ctx present");
            let run = (|| -> Result<()> {
                // refresh every channeled field's halo before the body runs
                for f in &mut ctx.fields {
                    if let Some(g) = f.ghosts.clone() {
                        g.exchange(&f.bytes, &mut f.outer)?;
                    }
                }
                body(ctx)
            })();
            *result_in.lock().unwrap() = Some(run);
        }),
    );
    state.sched.wait(done);

    // settle signals and restore the shards
    let rel = state.relations.get_mut(&ts.relation).expect("still present");
    let mut ctx = ctx.lock().unwrap().take().expect("ctx returned");
    for ((fid, access), tf) in ts.accesses.iter().zip(ctx.fields.drain(..)) {
        let f = rel.fields.get_mut(fid).expect("still present");
        f.bytes = tf.bytes;
        f.outer = tf.outer;
        state
            .sched
            .complete(&mut f.signals, access_privilege(*access), done);
    }

    result
        .lock()
        .unwrap()
        .take()
        .unwrap_or(Ok(()))
        .with_context(|| format!("task `{}` failed", ts.name))
}
