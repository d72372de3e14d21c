//! The delivery context: a single serial queue of tasks run against the [Engine].
//!
//! Everything which mutates the active job map, the memory cache or the reference counter runs as a [DeliveryTask].
//! Workers and dropped leases never touch that state directly; they post a task and the owner of the engine runs it,
//! either by pumping the engine by hand ([Engine::run_pending], [Engine::wait_and_run]) or by handing it to a
//! [DeliveryThread].
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::engine::Engine;
use crate::error::EngineError;

pub type DeliveryTask = Box<dyn FnOnce(&mut Engine) + Send>;

/// Somewhere tasks can be posted for serial, FIFO execution.
pub trait DeliveryContext {
    /// Queue a task.  Returns `false` if the context is gone, in which case the task was dropped unrun.
    fn post_task(&self, task: DeliveryTask) -> bool;
}

/// Cloneable sending side of an engine's delivery queue.
#[derive(Clone)]
pub struct DeliveryHandle {
    sender: Sender<DeliveryTask>,
}

impl DeliveryHandle {
    pub fn post<F: FnOnce(&mut Engine) + Send + 'static>(&self, task: F) -> bool {
        self.post_task(Box::new(task))
    }
}

impl DeliveryContext for DeliveryHandle {
    fn post_task(&self, task: DeliveryTask) -> bool {
        self.sender.send(task).is_ok()
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("queued", &self.sender.len())
            .finish()
    }
}

pub(crate) fn channel() -> (DeliveryHandle, Receiver<DeliveryTask>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (DeliveryHandle { sender }, receiver)
}

/// Owns an [Engine] on a dedicated thread which runs its delivery queue.
pub struct DeliveryThread {
    handle: DeliveryHandle,
    thread: Option<JoinHandle<Engine>>,
}

impl DeliveryThread {
    pub const THREAD_NAME: &'static str = "resource-delivery";

    pub fn spawn(engine: Engine) -> Result<DeliveryThread, EngineError> {
        let handle = engine.handle();
        let thread = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                let mut engine = engine;
                engine.run_until_stopped();
                engine
            })
            .map_err(EngineError::Spawn)?;
        Ok(DeliveryThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    pub fn post<F: FnOnce(&mut Engine) + Send + 'static>(&self, task: F) -> bool {
        self.handle.post(task)
    }

    /// Run everything already queued, stop, and give the engine back.
    ///
    /// Returns `None` if the delivery thread panicked, in which case the engine is lost.
    pub fn shutdown(mut self) -> Option<Engine> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Option<Engine> {
        let thread = self.thread.take()?;
        self.handle.post(Engine::stop);
        match thread.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                tracing::warn!("delivery thread panicked");
                None
            }
        }
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use crate::block::{BlockShape, PixelFormat};
    use crate::config::EngineConfigBuilder;
    use crate::error::ProduceError;
    use crate::key::Key;
    use crate::resource::Resource;
    use crate::traits::ProduceContext;

    fn engine() -> Engine {
        let config = EngineConfigBuilder::default()
            .worker_count(1usize)
            .build()
            .unwrap();
        Engine::new(config).unwrap()
    }

    #[test]
    fn tasks_run_in_order() {
        let thread = DeliveryThread::spawn(engine()).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(thread.post(move |_| {
                let _ = tx.send(i);
            }));
        }
        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(thread.shutdown().is_some());
    }

    #[test]
    fn loads_complete_on_the_delivery_thread() {
        let thread = DeliveryThread::spawn(engine()).unwrap();
        let (tx, rx) = unbounded();
        let key = Key::new("img1", 4, 4, ["d1"]);
        thread.post(move |engine| {
            engine.load(
                key,
                |_: &Key, ctx: &ProduceContext| -> Result<Resource, ProduceError> {
                    let shape = BlockShape::new(4, 4, PixelFormat::Rgba8888);
                    Ok(Resource::new(ctx.pool().get_or_alloc(&shape)))
                },
                move |result| {
                    let _ = tx.send(result.map(|lease| lease.size_bytes()));
                },
            );
        });

        let size = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(size, 64);

        let engine = thread.shutdown().expect("engine comes back");
        assert_eq!(engine.stats().completed, 1);
        assert_eq!(engine.active_jobs(), 0);
    }

    #[test]
    fn posting_after_the_engine_is_gone_fails() {
        let handle = {
            let engine = engine();
            engine.handle()
        };
        assert!(!handle.post(|_| {}));
    }
}
