//! VM pool.
//!
//! Script values are single-threaded, so each pooled VM lives on its own
//! worker thread and receives jobs over a channel. The pool bounds the number
//! of live VMs with a FIFO semaphore: the (limit+1)-th concurrent acquisition
//! suspends until a VM comes back. Workers are spawned lazily and reused;
//! a panicking script tears down only that worker's interpreter, which is
//! rebuilt in place.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore};

use crate::error::{ExecError, RuntimeError};
use crate::proto::FunctionProto;
use crate::registry::TypeRegistry;
use crate::value::HostValue;
use crate::vm::Vm;

pub const DEFAULT_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of VMs alive at once.
    pub limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            limit: DEFAULT_LIMIT,
        }
    }
}

enum Job {
    RunSource {
        source: String,
        args: Vec<HostValue>,
        reply: oneshot::Sender<Result<Vec<HostValue>, ExecError>>,
    },
    RunProto {
        proto: Box<FunctionProto>,
        args: Vec<HostValue>,
        reply: oneshot::Sender<Result<Vec<HostValue>, ExecError>>,
    },
    Close,
}

struct Worker {
    tx: mpsc::Sender<Job>,
}

pub struct VmPool {
    registry: Arc<TypeRegistry>,
    idle: Mutex<Vec<Worker>>,
    semaphore: Arc<Semaphore>,
}

impl VmPool {
    pub fn new(config: PoolConfig, registry: Arc<TypeRegistry>) -> Arc<VmPool> {
        Arc::new(VmPool {
            registry,
            idle: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(config.limit.max(1))),
        })
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Waits for capacity and hands out a VM; waiters are served in FIFO
    /// order. Fails promptly once the pool is shut down.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledVm, ExecError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecError::PoolClosed)?;
        let worker = {
            let mut idle = self.idle.lock().expect("pool freelist lock poisoned");
            idle.pop()
        };
        let worker = match worker {
            Some(worker) => worker,
            None => spawn_worker(self.registry.clone()),
        };
        Ok(PooledVm {
            pool: self.clone(),
            worker: Some(worker),
            _permit: permit,
        })
    }

    /// Acquire, run, release.
    pub async fn run(
        self: &Arc<Self>,
        source: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let mut vm = self.acquire().await?;
        vm.run_source(source, args).await
    }

    /// Like [`run`](Self::run) for an already-decoded prototype.
    pub async fn run_proto(
        self: &Arc<Self>,
        proto: FunctionProto,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let mut vm = self.acquire().await?;
        vm.run_proto(proto, args).await
    }

    /// Closes idle workers and fails all pending and future acquisitions.
    /// Outstanding executions finish on their worker threads; their VMs are
    /// dropped instead of being re-listed.
    pub fn shutdown(&self) {
        self.semaphore.close();
        let workers = {
            let mut idle = self.idle.lock().expect("pool freelist lock poisoned");
            std::mem::take(&mut *idle)
        };
        for worker in workers {
            let _ = worker.tx.send(Job::Close);
        }
    }

    fn release(&self, worker: Worker) {
        if self.semaphore.is_closed() {
            let _ = worker.tx.send(Job::Close);
            return;
        }
        self.idle
            .lock()
            .expect("pool freelist lock poisoned")
            .push(worker);
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.idle.lock().expect("pool freelist lock poisoned").len()
    }
}

/// Guard over a checked-out VM; returning it to the pool happens on drop.
pub struct PooledVm {
    pool: Arc<VmPool>,
    worker: Option<Worker>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledVm {
    pub async fn run_source(
        &mut self,
        source: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::RunSource {
                source: source.to_string(),
                args,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn run_proto(
        &mut self,
        proto: FunctionProto,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::RunProto {
                proto: Box::new(proto),
                args,
                reply,
            },
            rx,
        )
        .await
    }

    async fn submit(
        &mut self,
        job: Job,
        rx: oneshot::Receiver<Result<Vec<HostValue>, ExecError>>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let worker = self.worker.as_ref().ok_or(ExecError::WorkerGone)?;
        worker.tx.send(job).map_err(|_| ExecError::WorkerGone)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                // The worker thread died mid-job; drop it instead of
                // returning it to the freelist.
                self.worker = None;
                Err(ExecError::WorkerGone)
            }
        }
    }
}

impl Drop for PooledVm {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}

fn spawn_worker(registry: Arc<TypeRegistry>) -> Worker {
    let (tx, rx) = mpsc::channel::<Job>();
    std::thread::Builder::new()
        .name("crucible-vm".to_string())
        .spawn(move || worker_loop(rx, registry))
        .expect("failed to spawn vm worker thread");
    Worker { tx }
}

fn worker_loop(rx: mpsc::Receiver<Job>, registry: Arc<TypeRegistry>) {
    let mut vm = Vm::new(registry.clone());
    while let Ok(job) = rx.recv() {
        match job {
            Job::Close => break,
            Job::RunSource {
                source,
                args,
                reply,
            } => {
                let outcome = run_guarded(&mut vm, &registry, |vm| vm.run_source(&source, args));
                let _ = reply.send(outcome);
            }
            Job::RunProto { proto, args, reply } => {
                let outcome = run_guarded(&mut vm, &registry, |vm| {
                    vm.run_proto(&proto, args).map_err(ExecError::from)
                });
                let _ = reply.send(outcome);
            }
        }
    }
}

/// Runs one job, converting panics into runtime errors. A panic may leave the
/// interpreter in an unknown state, so the VM is rebuilt afterwards.
fn run_guarded(
    vm: &mut Vm,
    registry: &Arc<TypeRegistry>,
    job: impl FnOnce(&mut Vm) -> Result<Vec<HostValue>, ExecError>,
) -> Result<Vec<HostValue>, ExecError> {
    match panic::catch_unwind(AssertUnwindSafe(|| job(vm))) {
        Ok(result) => result,
        Err(_) => {
            *vm = Vm::new(registry.clone());
            Err(ExecError::Runtime(RuntimeError::new(
                0,
                "script execution panicked",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool_with_limit(limit: usize) -> Arc<VmPool> {
        VmPool::new(PoolConfig { limit }, TypeRegistry::with_defaults())
    }

    #[tokio::test]
    async fn run_collects_script_returns() {
        let pool = pool_with_limit(4);
        let out = pool
            .run(
                "this.returns(this.argv(1) + this.argv(2))",
                vec![HostValue::Int(2), HostValue::Int(3)],
            )
            .await
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(5)]);
    }

    #[tokio::test]
    async fn vms_are_reused_and_invocations_cleared() {
        let pool = pool_with_limit(1);
        let out = pool
            .run("this.returns(this.argc())", vec![HostValue::Int(9)])
            .await
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(1)]);
        assert_eq!(pool.idle_len(), 1);
        // Same worker, fresh invocation.
        let out = pool.run("this.returns(this.argc())", vec![]).await.unwrap();
        assert_eq!(out, vec![HostValue::Int(0)]);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn cap_blocks_the_excess_acquirer() {
        let pool = pool_with_limit(2);
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut vm = pool.acquire().await.unwrap();
                vm.run_source("this.returns(42)", vec![]).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        let out = tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .expect("third acquire should proceed after a release")
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(42)]);
    }

    #[tokio::test]
    async fn script_errors_do_not_poison_the_worker() {
        let pool = pool_with_limit(1);
        let err = pool.run("error('bad')", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecError::Runtime(_)));
        let out = pool.run("this.returns(1)", vec![]).await.unwrap();
        assert_eq!(out, vec![HostValue::Int(1)]);
    }

    #[tokio::test]
    async fn compile_errors_surface_from_run() {
        let pool = pool_with_limit(1);
        let err = pool.run("local = 1", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecError::Compile(_)));
    }

    #[tokio::test]
    async fn shutdown_fails_acquisition_promptly() {
        let pool = pool_with_limit(2);
        pool.run("this.returns(1)", vec![]).await.unwrap();
        pool.shutdown();
        let err = pool.acquire().await.err().expect("acquire after shutdown");
        assert!(matches!(err, ExecError::PoolClosed));
    }

    #[tokio::test]
    async fn concurrent_executions_are_isolated() {
        let pool = pool_with_limit(8);
        let mut handles = Vec::new();
        for i in 0..16i64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.run(
                    "this.returns(this.argv(1) * 2)",
                    vec![HostValue::Int(i)],
                )
                .await
                .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), vec![HostValue::Int(i as i64 * 2)]);
        }
    }
}
