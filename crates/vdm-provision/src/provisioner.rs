use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use thiserror::Error;

use crate::broadcaster::Broadcaster;

/// A machine-bootstrap function. It receives only a write-only byte sink;
/// there is no separate error channel — failures are encoded into the output
/// stream or observed through a later status check on the machine.
pub type ProvisionFn = Box<dyn FnOnce(&mut dyn Write) + Send + 'static>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning task already started")]
    AlreadyStarted,
}

/// One background bootstrap attempt against a newly created machine.
///
/// `run` starts the bootstrap function on its own thread and returns
/// immediately. Any number of callers may `wait` for completion and any
/// number of output sinks may be attached at any point, including mid-run
/// and after completion.
pub struct Provisioner {
    func: Mutex<Option<ProvisionFn>>,
    done: Arc<(Mutex<bool>, Condvar)>,
    output: Broadcaster,
}

impl Provisioner {
    pub fn new(func: ProvisionFn) -> Arc<Self> {
        Arc::new(Self {
            func: Mutex::new(Some(func)),
            done: Arc::new((Mutex::new(false), Condvar::new())),
            output: Broadcaster::new(),
        })
    }

    /// Start the task. Starting twice is a caller error.
    pub fn run(&self) -> Result<(), ProvisionError> {
        let func = self
            .func
            .lock()
            .unwrap()
            .take()
            .ok_or(ProvisionError::AlreadyStarted)?;

        let done = Arc::clone(&self.done);
        let mut output = self.output.clone();
        thread::spawn(move || {
            func(&mut output);

            let (flag, cvar) = &*done;
            let mut finished = flag.lock().unwrap();
            *finished = true;
            cvar.notify_all();
        });
        Ok(())
    }

    /// Block until the bootstrap function has returned. All concurrent
    /// waiters are released together; after completion this returns
    /// immediately.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.done;
        let mut finished = flag.lock().unwrap();
        while !*finished {
            finished = cvar.wait(finished).unwrap();
        }
    }

    /// Attach another output sink. A sink attached after completion receives
    /// nothing further but is accepted without error.
    pub fn add_output(&self, sink: Box<dyn Write + Send>) {
        self.output.add(sink);
    }
}
