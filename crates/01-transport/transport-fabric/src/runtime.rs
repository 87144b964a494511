use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};

/// A unit of work polled repeatedly by a runner. `do_work` must not block and
/// returns how much work it did; zero means the agent is idle.
pub trait Agent: Send {
    fn do_work(&mut self) -> usize;
    fn name(&self) -> &'static str;

    /// Called once on the runner thread after the last duty cycle.
    fn on_close(&mut self) {}
}

impl<A: Agent + ?Sized> Agent for Box<A> {
    fn do_work(&mut self) -> usize {
        (**self).do_work()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn on_close(&mut self) {
        (**self).on_close()
    }
}

/// How a runner waits when a duty cycle found nothing to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdleStrategy {
    BusySpin,
    Yield,
    Sleep { micros: u64 },
    /// Spin, then yield, then sleep with exponential growth up to `max_park_micros`.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        max_park_micros: u64,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff {
            max_spins: 64,
            max_yields: 16,
            max_park_micros: 1_000,
        }
    }
}

/// Stateful idler driven by the work count of each duty cycle.
#[derive(Debug)]
pub struct Idler {
    strategy: IdleStrategy,
    idle_cycles: u32,
}

impl Idler {
    pub fn new(strategy: IdleStrategy) -> Self {
        Self {
            strategy,
            idle_cycles: 0,
        }
    }

    pub fn idle(&mut self, work: usize) {
        if work > 0 {
            self.idle_cycles = 0;
            return;
        }

        match self.strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Sleep { micros } => thread::sleep(Duration::from_micros(micros)),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                max_park_micros,
            } => {
                let cycle = self.idle_cycles;
                self.idle_cycles = self.idle_cycles.saturating_add(1);
                if cycle < max_spins {
                    std::hint::spin_loop();
                } else if cycle < max_spins.saturating_add(max_yields) {
                    thread::yield_now();
                } else {
                    let exponent = (cycle - max_spins - max_yields).min(20);
                    let park = (1u64 << exponent).min(max_park_micros.max(1));
                    thread::sleep(Duration::from_micros(park));
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.idle_cycles = 0;
    }
}

/// Runs one agent on a dedicated, named thread until closed.
pub struct AgentRunner {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AgentRunner {
    pub fn start<A>(mut agent: A, idle: IdleStrategy) -> FabricResult<Self>
    where
        A: Agent + 'static,
    {
        let name = agent.name();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!(agent = name, "agent started");
                let mut idler = Idler::new(idle);
                while flag.load(Ordering::Acquire) {
                    let work = agent.do_work();
                    idler.idle(work);
                }
                agent.on_close();
                tracing::debug!(agent = name, "agent stopped");
            })
            .map_err(FabricError::Spawn)?;

        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.handle.is_some()
    }

    /// Signals the agent to stop and joins its thread. Idempotent.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(agent = self.name, "agent thread panicked");
            }
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Steps several agents on the calling thread.
pub struct WorkerRuntime {
    agents: Vec<Box<dyn Agent>>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self { agents: Vec::new() }
    }

    pub fn register<A>(&mut self, agent: A)
    where
        A: Agent + 'static,
    {
        self.agents.push(Box::new(agent));
    }

    pub fn run_tick(&mut self) -> usize {
        let mut work = 0;
        for agent in self.agents.iter_mut() {
            work += agent.do_work();
        }
        work
    }

    /// Ticks until a full pass does no work after `idle_threshold` has elapsed.
    pub fn run_until_idle(&mut self, idle_threshold: Duration) {
        let deadline = Instant::now() + idle_threshold;
        loop {
            let work = self.run_tick();
            if work == 0 && Instant::now() >= deadline {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        polls: Arc<AtomicUsize>,
        budget: usize,
        closed: Arc<AtomicBool>,
    }

    impl Agent for Counting {
        fn do_work(&mut self) -> usize {
            self.polls.fetch_add(1, Ordering::Relaxed);
            if self.budget > 0 {
                self.budget -= 1;
                1
            } else {
                0
            }
        }

        fn name(&self) -> &'static str {
            "counting-agent"
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn runner_polls_until_closed() {
        let polls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let mut runner = AgentRunner::start(
            Counting {
                polls: Arc::clone(&polls),
                budget: 10,
                closed: Arc::clone(&closed),
            },
            IdleStrategy::Yield,
        )
        .expect("start runner");

        assert_eq!(runner.name(), "counting-agent");
        while polls.load(Ordering::Relaxed) < 20 {
            thread::yield_now();
        }
        runner.close();
        assert!(!runner.is_running());
        assert!(closed.load(Ordering::Acquire), "on_close runs on shutdown");
        runner.close();
    }

    #[test]
    fn runtime_ticks_every_agent() {
        let polls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let mut runtime = WorkerRuntime::new();
        for _ in 0..3 {
            runtime.register(Counting {
                polls: Arc::clone(&polls),
                budget: 2,
                closed: Arc::clone(&closed),
            });
        }

        assert_eq!(runtime.run_tick(), 3);
        assert_eq!(runtime.run_tick(), 3);
        assert_eq!(runtime.run_tick(), 0);
        runtime.run_until_idle(Duration::ZERO);
        assert!(polls.load(Ordering::Relaxed) >= 12);
    }

    #[test]
    fn backoff_escalates_and_resets() {
        let mut idler = Idler::new(IdleStrategy::Backoff {
            max_spins: 1,
            max_yields: 1,
            max_park_micros: 5,
        });
        for _ in 0..4 {
            idler.idle(0);
        }
        assert_eq!(idler.idle_cycles, 4);
        idler.idle(3);
        assert_eq!(idler.idle_cycles, 0);
    }
}
