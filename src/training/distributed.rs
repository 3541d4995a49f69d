//! Replica identity and collective operations.
//!
//! Every component that depends on the process layout receives a [`RuntimeContext`]
//! instead of reading global state. Collectives block until all replicas reach the same
//! call, there is no timeout. A replica of a [`LocalGroup`] that fails aborts the group,
//! the replicas waiting on a collective then return [`Error::Coordination`].
use crate::error::{Error, Result};
use crate::utils::replica_device;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tch::{nn, Device, Tensor};

/// Collective operations between the replicas of a training run.
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;

    /// Blocks until every replica has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Returns the tensor held by `root` on every replica.
    fn broadcast(&self, rank: usize, tensor: &Tensor, root: usize) -> Result<Tensor>;

    /// Returns the tensors of all replicas, ordered by rank.
    fn all_gather(&self, rank: usize, tensor: &Tensor) -> Result<Vec<Tensor>>;

    /// Elementwise mean over the replicas.
    fn all_reduce_mean(&self, rank: usize, tensor: &Tensor) -> Result<Tensor> {
        let tensors = self.all_gather(rank, tensor)?;
        Ok(Tensor::stack(&tensors, 0).mean_dim(Some([0i64].as_slice()), false, tensor.kind()))
    }
}

/// A run with a single replica, every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _rank: usize, tensor: &Tensor, _root: usize) -> Result<Tensor> {
        Ok(tensor.copy())
    }

    fn all_gather(&self, _rank: usize, tensor: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![tensor.copy()])
    }

    fn all_reduce_mean(&self, _rank: usize, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.copy())
    }
}

/// Arrivals at the current barrier and the number of completed barriers.
#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Replicas running as threads of the same process, exchanging tensors through host
/// memory.
pub struct LocalGroup {
    world_size: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    aborted: AtomicBool,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// Aborts the group when the replica thread unwinds.
struct AbortOnPanic<'a>(&'a LocalGroup);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort()
        }
    }
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Result<Arc<Self>> {
        if world_size < 1 {
            return Err(Error::config("a group needs at least one replica"));
        }
        Ok(Arc::new(Self {
            world_size,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            aborted: AtomicBool::new(false),
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
        }))
    }

    /// Runs `f` on `world_size` threads, one per replica, and returns the results in rank
    /// order. Replica `r` uses the `r`-th accelerator when available.
    ///
    /// When a replica fails the group is aborted and the first error that is not a
    /// coordination error is returned, so the root cause is reported rather than the
    /// failure of the peers.
    pub fn run<T, F>(world_size: usize, cpu: bool, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(RuntimeContext) -> Result<T> + Sync,
    {
        let group = Self::new(world_size)?;
        let results: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let collective: Arc<dyn Collective> = group.clone();
                    let ctx = RuntimeContext::new(rank, replica_device(rank, cpu), collective);
                    let (f, group) = (&f, &group);
                    scope.spawn(move || {
                        let _guard = AbortOnPanic(group.as_ref());
                        let result = f(ctx);
                        if let Err(err) = &result {
                            if !matches!(err, Error::Coordination(_)) {
                                tracing::error!(rank, %err, "replica failed, aborting the group");
                            }
                            group.abort();
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| Err(Error::Coordination("a replica panicked".to_string())))
                })
                .collect()
        });
        let mut values = Vec::with_capacity(world_size);
        let mut first_err = None;
        for result in results {
            match result {
                Ok(v) => values.push(v),
                Err(err) => {
                    let replace = match &first_err {
                        None => true,
                        Some(Error::Coordination(_)) => !matches!(err, Error::Coordination(_)),
                        Some(_) => false,
                    };
                    if replace {
                        first_err = Some(err)
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Marks the group as failed and wakes up the replicas blocked on a collective. Every
    /// later collective fails too.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        // Taking the lock orders the flag with the waiters going to sleep.
        let _state = self.state.lock();
        self.released.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn aborted_error() -> Error {
        Error::Coordination("another replica failed".to_string())
    }

    /// Waits for all the replicas, or for the group to be aborted.
    fn wait(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Coordination("poisoned barrier state".to_string()))?;
        if self.is_aborted() {
            return Err(Self::aborted_error());
        }
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !self.is_aborted() {
            state = self
                .released
                .wait(state)
                .map_err(|_| Error::Coordination("poisoned barrier state".to_string()))?;
        }
        if state.generation == generation {
            return Err(Self::aborted_error());
        }
        Ok(())
    }

    fn put(&self, rank: usize, tensor: Tensor) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Coordination("poisoned collective state".to_string()))?;
        slots[rank] = Some(tensor);
        Ok(())
    }

    fn get(&self, rank: usize) -> Result<Tensor> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| Error::Coordination("poisoned collective state".to_string()))?;
        match &slots[rank] {
            Some(tensor) => Ok(tensor.copy()),
            None => Err(Error::Coordination(format!("replica {rank} did not contribute"))),
        }
    }
}

impl Collective for LocalGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.wait()
    }

    fn broadcast(&self, rank: usize, tensor: &Tensor, root: usize) -> Result<Tensor> {
        if rank == root {
            self.put(root, tensor.to_device(Device::Cpu).copy())?;
        }
        self.wait()?;
        let result = self.get(root);
        // The slot is only reused once everybody has read it.
        self.wait()?;
        Ok(result?.to_device(tensor.device()))
    }

    fn all_gather(&self, rank: usize, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.put(rank, tensor.to_device(Device::Cpu).copy())?;
        self.wait()?;
        let result: Result<Vec<Tensor>> = (0..self.world_size).map(|r| self.get(r)).collect();
        self.wait()?;
        Ok(result?.into_iter().map(|t| t.to_device(tensor.device())).collect())
    }
}

/// The identity of a replica and the operations it can use to talk to the others.
#[derive(Clone)]
pub struct RuntimeContext {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    collective: Arc<dyn Collective>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish()
    }
}

impl RuntimeContext {
    pub fn new(rank: usize, device: Device, collective: Arc<dyn Collective>) -> Self {
        Self { rank, world_size: collective.world_size(), device, collective }
    }

    pub fn single(device: Device) -> Self {
        Self::new(0, device, Arc::new(SingleProcess))
    }

    /// True on the replica in charge of file writes and logging.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn barrier(&self) -> Result<()> {
        self.collective.barrier()
    }

    pub fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        self.collective.broadcast(self.rank, tensor, root)
    }

    pub fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.collective.all_gather(self.rank, tensor)
    }

    pub fn all_reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        self.collective.all_reduce_mean(self.rank, tensor)
    }
}

/// Overwrites the variables of every replica with the ones of replica `root`, walking them
/// in name order.
pub fn broadcast_variables(vs: &mut nn::VarStore, ctx: &RuntimeContext, root: usize) -> Result<()> {
    if ctx.world_size == 1 {
        return Ok(());
    }
    let _no_grad = tch::no_grad_guard();
    let variables: BTreeMap<String, Tensor> = vs.variables().into_iter().collect();
    for (_name, mut var) in variables {
        let value = ctx.broadcast(&var, root)?;
        var.copy_(&value);
    }
    Ok(())
}

/// Replaces every gradient by its mean over the replicas. Parameters without a gradient
/// contribute zeros so that all replicas issue the same collectives.
pub fn all_reduce_gradients(params: &BTreeMap<String, Tensor>, ctx: &RuntimeContext) -> Result<()> {
    if ctx.world_size == 1 {
        return Ok(());
    }
    let _no_grad = tch::no_grad_guard();
    for param in params.values() {
        let mut grad = param.grad();
        let local = if grad.defined() { grad.shallow_clone() } else { param.zeros_like() };
        let mean = ctx.all_reduce_mean(&local)?;
        if grad.defined() {
            grad.copy_(&mean);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_copies_the_root_tensor() {
        let results = LocalGroup::run(3, true, |ctx| {
            let local = Tensor::from_slice(&[ctx.rank as f32; 4]);
            let value = ctx.broadcast(&local, 0)?;
            Ok(Vec::<f32>::try_from(value).unwrap_or_default())
        })
        .unwrap();
        for values in results {
            assert_eq!(values, vec![0.; 4]);
        }
    }

    #[test]
    fn all_gather_is_ordered_by_rank() {
        let results = LocalGroup::run(4, true, |ctx| {
            let local = Tensor::from_slice(&[ctx.rank as i64]);
            let gathered = ctx.all_gather(&local)?;
            let mean = ctx.all_reduce_mean(&local.to_kind(tch::Kind::Float))?;
            Ok((Tensor::cat(&gathered, 0), mean.double_value(&[0])))
        })
        .unwrap();
        for (gathered, mean) in results {
            assert_eq!(Vec::<i64>::try_from(gathered).unwrap(), vec![0, 1, 2, 3]);
            assert_eq!(mean, 1.5);
        }
    }

    #[test]
    fn gradients_are_averaged_over_replicas() {
        let results = LocalGroup::run(2, true, |ctx| {
            let mut vs = nn::VarStore::new(Device::Cpu);
            let w = vs.root().var("w", &[2], nn::Init::Const(ctx.rank as f64 + 1.));
            broadcast_variables(&mut vs, &ctx, 0)?;
            let params: BTreeMap<String, Tensor> = vs.variables().into_iter().collect();
            // Both replicas start from w = 1, the gradients are 1 and 2.
            (&w * (ctx.rank as f64 + 1.)).sum(tch::Kind::Float).backward();
            all_reduce_gradients(&params, &ctx)?;
            Ok((w.double_value(&[0]), w.grad().double_value(&[1])))
        })
        .unwrap();
        assert_eq!(results, vec![(1., 1.5), (1., 1.5)]);
    }

    #[test]
    fn a_failing_replica_releases_its_peers() {
        let result = LocalGroup::run(3, true, |ctx| {
            if ctx.rank == 0 {
                return Err(Error::resource("fid_cache.npz", "missing"));
            }
            // Replicas 1 and 2 wait for replica 0, which never arrives.
            let local = Tensor::from_slice(&[ctx.rank as f32]);
            ctx.all_reduce_mean(&local)?;
            ctx.barrier()?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Resource { .. })), "{result:?}");
    }

    #[test]
    fn aborted_group_fails_every_collective() {
        let group = LocalGroup::new(2).unwrap();
        group.abort();
        let ctx = RuntimeContext::new(1, Device::Cpu, group.clone());
        assert!(matches!(ctx.barrier(), Err(Error::Coordination(_))));
        let xs = Tensor::from_slice(&[1f32]);
        assert!(matches!(ctx.broadcast(&xs, 0), Err(Error::Coordination(_))));
    }

    #[test]
    fn barriers_can_be_reused() {
        let results = LocalGroup::run(2, true, |ctx| {
            for _ in 0..50 {
                ctx.barrier()?;
            }
            Ok(ctx.rank)
        })
        .unwrap();
        assert_eq!(results, vec![0, 1]);
    }

    #[test]
    fn single_process_is_the_identity() {
        let ctx = RuntimeContext::single(Device::Cpu);
        let xs = Tensor::from_slice(&[1f32, 2.]);
        assert!(ctx.all_reduce_mean(&xs).unwrap().equal(&xs));
        assert_eq!(ctx.all_gather(&xs).unwrap().len(), 1);
        assert!(ctx.is_main());
    }
}
