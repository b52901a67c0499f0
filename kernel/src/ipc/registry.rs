//! The AMC service registry (spec 4.E): the name→service and task→service
//! maps, each service's inbox and shared-memory list, and the
//! pending-to-unknown pool.
//!
//! Locking discipline matches spec section 5: a single registry-global lock
//! guards `by_name`/`by_task`/`pending_unknown`; each service's own
//! [`Mutex<ServiceState>`] guards its inbox and shared-memory list. Code
//! that needs both takes the global lock first, clones out the `Arc`s it
//! needs, drops the global lock, then locks the per-service state in name
//! order.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::IpcError;
use crate::mm::{AddressSpace, PageFlags};
use crate::sched::{self, BlockReason, TaskId};
use crate::sync::once_lock::GlobalState;

use super::message::{Message, ServiceName, MAX_BODY_LEN};
use super::shared_memory::{self, SharedMemoryRegion};

/// Size of a service's delivery pool (spec 3, "Delivery pool").
pub const DELIVERY_POOL_SIZE: usize = 32 * 1024 * 1024;
/// Hint for where delivery pools land in a task's address space.
const DELIVERY_POOL_HINT: u64 = 0x0000_2000_0000_0000;
/// Bound on a single service's inbox (spec 3, "FIFO inbox (bounded
/// sequence)").
pub const INBOX_CAPACITY: usize = 256;
/// Bound on the pending-to-unknown queue, per destination name.
const PENDING_UNKNOWN_CAPACITY: usize = 64;

/// Built-in kernel-state event codes a task may send to `"core"` (spec
/// section 6). Exact numeric values are this core's own build-time
/// convention; the distilled protocol only names the four events.
pub mod core_event {
    pub const FILE_MANAGER_MAP_INITRD: u32 = 1;
    pub const AMC_EXEC_BUFFER: u32 = 2;
    pub const SLEEP_UNTIL_TIMESTAMP: u32 = 3;
    pub const ALLOC_PHYSICAL_RANGE: u32 = 4;
}

/// Which sources an `await` call accepts.
#[derive(Debug, Clone, Copy)]
pub enum AwaitFilter<'a> {
    Any,
    One(&'a str),
    Set(&'a [&'a str]),
}

impl AwaitFilter<'_> {
    fn matches(&self, source: &ServiceName) -> bool {
        match self {
            AwaitFilter::Any => true,
            AwaitFilter::One(name) => source.as_str() == *name,
            AwaitFilter::Set(names) => names.iter().any(|n| source.as_str() == *n),
        }
    }
}

struct ServiceState {
    name: ServiceName,
    owner: TaskId,
    delivery_pool_base: u64,
    inbox: VecDeque<Message>,
    shared_memory: Vec<SharedMemoryRegion>,
    death_subscribers: Vec<ServiceName>,
}

struct Registry {
    by_name: BTreeMap<ServiceName, Arc<Mutex<ServiceState>>>,
    by_task: BTreeMap<TaskId, Arc<Mutex<ServiceState>>>,
    pending_unknown: BTreeMap<ServiceName, VecDeque<Message>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            by_name: BTreeMap::new(),
            by_task: BTreeMap::new(),
            pending_unknown: BTreeMap::new(),
        }
    }
}

static REGISTRY: GlobalState<Mutex<Registry>> = GlobalState::new();

pub fn init() {
    REGISTRY
        .init(Mutex::new(Registry::new()))
        .unwrap_or_else(|_| panic!("amc: registry init called twice"));
}

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    REGISTRY.with_mut(|mtx| f(&mut mtx.lock())).expect("amc registry used before init")
}

/// Associate `task` with a new service named `name` (spec 4.E, `register`).
///
/// Refuses if `task` already owns a service, or if `name` is already held by
/// another task — the incumbent keeps the name untouched; the caller gets
/// `NameAlreadyRegistered` back.
pub fn register(task: TaskId, name: &str) -> Result<(), IpcError> {
    let service_name = ServiceName::new(name).map_err(|_| IpcError::InvalidServiceName)?;

    if with_registry(|r| r.by_task.contains_key(&task)) {
        return Err(IpcError::TaskAlreadyHasService);
    }

    if with_registry(|r| r.by_name.contains_key(&service_name)) {
        return Err(IpcError::NameAlreadyRegistered);
    }

    let pool_base = sched::with_task(task, |t| {
        t.address_space
            .alloc_range(DELIVERY_POOL_HINT, DELIVERY_POOL_SIZE, PageFlags::USER_DATA)
    })
    .ok_or(IpcError::UnknownDestination)?
    .map_err(|_| IpcError::UnknownDestination)?;

    let state = Arc::new(Mutex::new(ServiceState {
        name: service_name.clone(),
        owner: task,
        delivery_pool_base: pool_base,
        inbox: VecDeque::new(),
        shared_memory: Vec::new(),
        death_subscribers: Vec::new(),
    }));

    let pending = with_registry(|r| {
        r.by_name.insert(service_name.clone(), state.clone());
        r.by_task.insert(task, state.clone());
        r.pending_unknown.remove(&service_name)
    });

    sched::with_task(task, |t| t.owned_service = Some(task.as_u64()));

    if let Some(queued) = pending {
        let mut inbox = state.lock();
        for msg in queued {
            inbox.inbox.push_back(msg);
        }
        drop(inbox);
        let _ = sched::unblock(task, BlockReason::AWAIT_MESSAGE);
    }

    log::debug!("amc: {} registered service '{}'", task, service_name);
    Ok(())
}

/// Send `body` from `source`'s service to `dest` (spec 4.E, `send`).
pub fn send(source: TaskId, dest: &str, body: &[u8]) -> Result<(), IpcError> {
    if body.len() > MAX_BODY_LEN {
        return Err(IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN });
    }
    let dest_name = ServiceName::new(dest).map_err(|_| IpcError::InvalidServiceName)?;
    let source_name = service_name_of(source).ok_or(IpcError::UnknownDestination)?;

    if dest_name.is_core() {
        return handle_core_message(source, body);
    }

    let message = Message::new(source_name, dest_name.clone(), body)
        .map_err(|_| IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN })?;
    deliver(message)
}

/// Route a message that is already fully formed, used both by `send` and by
/// the `"core"`-origin synthetic messages (`ServiceDied`, etc.).
fn deliver(message: Message) -> Result<(), IpcError> {
    let target = with_registry(|r| r.by_name.get(&message.dest).cloned());
    match target {
        Some(state) => {
            let owner = {
                let mut svc = state.lock();
                if svc.inbox.len() >= INBOX_CAPACITY {
                    return Err(IpcError::InboxFull { capacity: INBOX_CAPACITY });
                }
                svc.inbox.push_back(message);
                svc.owner
            };
            let _ = sched::unblock(owner, BlockReason::AWAIT_MESSAGE);
            Ok(())
        }
        None => {
            with_registry(|r| {
                let queue = r.pending_unknown.entry(message.dest.clone()).or_default();
                if queue.len() >= PENDING_UNKNOWN_CAPACITY {
                    queue.pop_front();
                }
                queue.push_back(message);
            });
            Ok(())
        }
    }
}

/// Construct a message with source `"core"` and deliver it directly,
/// bypassing the sender-resolution `send` normally does (spec section F:
/// "AMC core-origin messages").
pub fn deliver_from_core(dest: &ServiceName, body: &[u8]) -> Result<(), IpcError> {
    let core_name = ServiceName::new(ServiceName::CORE).expect("'core' is always a valid name");
    let message = Message::new(core_name, dest.clone(), body)
        .map_err(|_| IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN })?;
    deliver(message)
}

fn handle_core_message(sender: TaskId, body: &[u8]) -> Result<(), IpcError> {
    if body.len() < 4 {
        return Err(IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN });
    }
    let mut event_bytes = [0u8; 4];
    event_bytes.copy_from_slice(&body[0..4]);
    let event = u32::from_le_bytes(event_bytes);

    match event {
        core_event::SLEEP_UNTIL_TIMESTAMP => {
            if body.len() < 12 {
                return Err(IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN });
            }
            let mut wake_bytes = [0u8; 8];
            wake_bytes.copy_from_slice(&body[4..12]);
            let wake_ms = u64::from_le_bytes(wake_bytes);
            sched::block(sender, BlockReason::AWAIT_TIMESTAMP, Some(wake_ms), None)
                .map_err(|_| IpcError::UnknownDestination)?;
            Ok(())
        }
        core_event::ALLOC_PHYSICAL_RANGE => {
            if body.len() < 12 {
                return Err(IpcError::BodyTooLarge { size: body.len(), max: MAX_BODY_LEN });
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&body[4..12]);
            let size = u64::from_le_bytes(size_bytes) as usize;
            let pages = size.div_ceil(crate::mm::FRAME_SIZE);
            match crate::mm::frame_allocator::FRAME_ALLOCATOR.alloc_contiguous(pages) {
                Ok(frame) => {
                    log::debug!("amc: core ALLOC_PHYSICAL_RANGE for {} -> frame {:#x}", sender, frame.as_u64());
                    Ok(())
                }
                Err(_) => Err(IpcError::UnknownDestination),
            }
        }
        core_event::FILE_MANAGER_MAP_INITRD | core_event::AMC_EXEC_BUFFER => {
            log::debug!("amc: core event {} from {} is a no-op in this core", event, sender);
            Ok(())
        }
        other => {
            log::warn!("amc: unrecognized core event {} from {}", other, sender);
            Err(IpcError::UnknownDestination)
        }
    }
}

/// Block the caller until a message from a source matching `filter` is
/// available, then copy it into the caller's delivery pool (spec 4.E,
/// `await`/`await_from_set`). Never fails; returns the pool base and the
/// message's length.
pub fn await_message(task: TaskId, filter: AwaitFilter<'_>) -> (u64, usize) {
    loop {
        if let Some((pool_base, len)) = try_take(task, filter) {
            return (pool_base, len);
        }
        let service_id = with_registry(|r| r.by_task.get(&task).map(|s| s.lock().owner.as_u64()));
        let _ = sched::block(task, BlockReason::AWAIT_MESSAGE, None, service_id);
    }
}

fn try_take(task: TaskId, filter: AwaitFilter<'_>) -> Option<(u64, usize)> {
    let state = with_registry(|r| r.by_task.get(&task).cloned())?;
    let mut svc = state.lock();
    let idx = svc.inbox.iter().position(|m| filter.matches(&m.source))?;
    let message = svc.inbox.remove(idx).expect("index just found");
    let pool_base = svc.delivery_pool_base;
    drop(svc);

    let wire_len = message.wire_len();
    // SAFETY: `pool_base` is a 32 MiB region mapped only into `task`'s
    // address space, and `await_message` is only ever called while `task`
    // is the currently running task (its address space is the active one),
    // so this pointer is valid and writable for `wire_len` <= DELIVERY_POOL_SIZE.
    let pool = unsafe { core::slice::from_raw_parts_mut(pool_base as *mut u8, DELIVERY_POOL_SIZE) };
    message.encode(&mut pool[..wire_len]);
    Some((pool_base, wire_len))
}

/// Non-blocking inbox query (spec 4.E, `has_message`).
pub fn has_message(task: TaskId, filter: AwaitFilter<'_>) -> bool {
    let Some(state) = with_registry(|r| r.by_task.get(&task).cloned()) else {
        return false;
    };
    state.lock().inbox.iter().any(|m| filter.matches(&m.source))
}

fn service_name_of(task: TaskId) -> Option<ServiceName> {
    with_registry(|r| r.by_task.get(&task).map(|s| s.lock().name.clone()))
}

/// Public wrapper over [`service_name_of`] for the crash-report path, which
/// needs to know whether the dying task owns the crash-reporter (or another
/// excluded) service before deciding whether to post a report via AMC.
pub fn owned_service_name(task: TaskId) -> Option<ServiceName> {
    service_name_of(task)
}

/// Whether a service named `name` is currently registered. Used by the
/// crash-report path to decide whether posting to the reporter is even
/// possible before composing the report.
pub fn service_exists(name: &str) -> bool {
    let Ok(service_name) = ServiceName::new(name) else {
        return false;
    };
    with_registry(|r| r.by_name.contains_key(&service_name))
}

/// Create a shared-memory region between the caller's service and `peer`
/// (spec 4.E, `shared_memory_create`). Returns `(local_va, remote_va)`.
pub fn shared_memory_create(caller: TaskId, peer: &str, size: usize) -> Result<(u64, u64), IpcError> {
    let peer_name = ServiceName::new(peer).map_err(|_| IpcError::InvalidServiceName)?;

    let (local_state, remote_state) = with_registry(|r| {
        let local = r.by_task.get(&caller).cloned();
        let remote = r.by_name.get(&peer_name).cloned();
        (local, remote)
    });
    let local_state = local_state.ok_or(IpcError::UnknownDestination)?;
    let remote_state = remote_state.ok_or(IpcError::PeerMissing)?;

    // Lock order: by service name, to match spec section 5's "both service
    // locks in name order" discipline.
    let (local_name, remote_name) = {
        let l = local_state.lock().name.clone();
        let r = remote_state.lock().name.clone();
        (l, r)
    };

    let local_owner = local_state.lock().owner;
    let remote_owner = remote_state.lock().owner;

    let (local_descriptor, remote_descriptor) = {
        let l = local_state.lock().shared_memory.len();
        let r = remote_state.lock().shared_memory.len();
        (l, r)
    };

    let pair = sched::with_two_tasks(local_owner, remote_owner, |local_task, remote_task| {
        create_pair_ordered(
            &local_task.address_space,
            &local_name,
            local_descriptor,
            &remote_task.address_space,
            &remote_name,
            remote_descriptor,
            size,
        )
    })
    .ok_or(IpcError::UnknownDestination)??;

    let local_va = pair.local.local_va;
    let remote_va = pair.remote.local_va;

    if local_name < remote_name {
        local_state.lock().shared_memory.push(pair.local);
        remote_state.lock().shared_memory.push(pair.remote);
    } else {
        remote_state.lock().shared_memory.push(pair.remote);
        local_state.lock().shared_memory.push(pair.local);
    }

    Ok((local_va, remote_va))
}

#[allow(clippy::too_many_arguments)]
fn create_pair_ordered(
    local: &AddressSpace,
    local_name: &ServiceName,
    local_descriptor: usize,
    remote: &AddressSpace,
    remote_name: &ServiceName,
    remote_descriptor: usize,
    size: usize,
) -> Result<shared_memory::CreatedPair, IpcError> {
    shared_memory::create(local, local_name, local_descriptor, remote, remote_name, remote_descriptor, size)
}

/// Undo a shared-memory region identified by its local virtual address
/// (spec 4.E, `shared_memory_destroy`).
pub fn shared_memory_destroy(caller: TaskId, descriptor: u64) -> Result<(), IpcError> {
    let local_state = with_registry(|r| r.by_task.get(&caller).cloned()).ok_or(IpcError::SharedMemoryNotFound)?;

    let region = {
        let mut svc = local_state.lock();
        let idx = svc
            .shared_memory
            .iter()
            .position(|r| r.local_va == descriptor)
            .ok_or(IpcError::SharedMemoryNotFound)?;
        svc.shared_memory.remove(idx)
    };

    let remote_state = with_registry(|r| r.by_name.get(&region.peer).cloned()).ok_or(IpcError::SharedMemoryNotFound)?;
    let remote_region = {
        let mut svc = remote_state.lock();
        if region.peer_descriptor >= svc.shared_memory.len() {
            return Err(IpcError::SharedMemoryPeerMismatch);
        }
        svc.shared_memory.remove(region.peer_descriptor)
    };

    let local_owner = local_state.lock().owner;
    let remote_owner = remote_state.lock().owner;
    let remote_va = remote_region.local_va;

    sched::with_two_tasks(local_owner, remote_owner, |local_task, remote_task| {
        shared_memory::destroy(&local_task.address_space, &remote_task.address_space, &region, remote_va);
    });

    Ok(())
}

/// Kernel-side bootstrap for a fixed allow-list of built-in drivers (spec
/// 4.E, `launch_service`). This core does not itself spawn the driver
/// tasks (no ELF loader is in scope) — it only validates the name against
/// the allow-list and logs the request, leaving actual process creation to
/// whatever boots the initial service set.
const LAUNCHABLE_SERVICES: &[&str] = &["nic", "disk", "console"];

pub fn launch_service(name: &str) -> Result<(), IpcError> {
    if LAUNCHABLE_SERVICES.contains(&name) {
        log::info!("amc: launch_service('{}') requested", name);
        Ok(())
    } else {
        Err(IpcError::UnknownService)
    }
}

/// Register `caller` to receive a `ServiceDied` message when `target`'s
/// service is torn down (spec 4.E, `service_died_notify`).
pub fn service_died_notify(caller: TaskId, target: &str) -> Result<(), IpcError> {
    let target_name = ServiceName::new(target).map_err(|_| IpcError::InvalidServiceName)?;
    let caller_name = service_name_of(caller).ok_or(IpcError::UnknownDestination)?;

    let target_state = with_registry(|r| r.by_name.get(&target_name).cloned());
    match target_state {
        Some(state) => {
            state.lock().death_subscribers.push(caller_name);
            Ok(())
        }
        None => {
            // Target not registered yet: still accepted, but there is
            // nothing to subscribe to. A subscription against a service
            // that never registers simply never fires, matching spec's
            // "no generic cancellation" stance on indefinite waits.
            log::debug!("amc: service_died_notify target '{}' not yet registered", target_name);
            Ok(())
        }
    }
}

/// Tear down the AMC service owned by `task`, if any (spec 4.E, "Death
/// notification"). Called from [`crate::sched::scheduler::die`] with the
/// raw task id it stored in `Task::owned_service`.
pub fn service_died(owned_service_raw: u64) {
    teardown_service(TaskId::from_raw(owned_service_raw));
}

fn teardown_service(owner: TaskId) {
    let state = with_registry(|r| {
        let state = r.by_task.remove(&owner);
        if let Some(state) = &state {
            let name = state.lock().name.clone();
            r.by_name.remove(&name);
        }
        state
    });
    let Some(state) = state else { return };

    let (name, shared_memory, death_subscribers) = {
        let mut svc = state.lock();
        svc.inbox.clear();
        (svc.name.clone(), core::mem::take(&mut svc.shared_memory), core::mem::take(&mut svc.death_subscribers))
    };

    for region in shared_memory {
        let remote_state = with_registry(|r| r.by_name.get(&region.peer).cloned());
        if let Some(remote_state) = remote_state {
            let remote_owner = remote_state.lock().owner;
            let remote_region = {
                let mut svc = remote_state.lock();
                if region.peer_descriptor < svc.shared_memory.len() {
                    Some(svc.shared_memory.remove(region.peer_descriptor))
                } else {
                    None
                }
            };
            if let Some(remote_region) = remote_region {
                sched::with_two_tasks(owner, remote_owner, |owner_task, remote_task| {
                    shared_memory::destroy(
                        &owner_task.address_space,
                        &remote_task.address_space,
                        &remote_region,
                        region.local_va,
                    );
                });
            }
        }
    }

    for subscriber in death_subscribers {
        let mut body = Vec::with_capacity(4 + name.as_str().len());
        body.extend_from_slice(&1u32.to_le_bytes()); // ServiceDied tag
        body.extend_from_slice(name.as_str().as_bytes());
        let _ = deliver_from_core(&subscriber, &body);
    }

    log::debug!("amc: service '{}' torn down", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_filter_any_matches_everything() {
        let name = ServiceName::new("x").unwrap();
        assert!(AwaitFilter::Any.matches(&name));
    }

    #[test]
    fn await_filter_one_matches_only_named_source() {
        let name = ServiceName::new("a").unwrap();
        assert!(AwaitFilter::One("a").matches(&name));
        assert!(!AwaitFilter::One("b").matches(&name));
    }

    #[test]
    fn await_filter_set_matches_any_member() {
        let name = ServiceName::new("b").unwrap();
        assert!(AwaitFilter::Set(&["a", "b", "c"]).matches(&name));
        assert!(!AwaitFilter::Set(&["a", "c"]).matches(&name));
    }
}
