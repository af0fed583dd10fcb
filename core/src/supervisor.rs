//! Hosts the service across identity collisions.
//!
//! A collision termination means some other node on the planet holds our
//! overlay address: the only safe move is to retire the local identity and
//! start over with a fresh one. The supervisor archives the old secret,
//! deletes the public half, reports the collision, and restarts the
//! service; any other termination is returned to the caller.

use crate::engine::{EngineFactory, IpStack, PortMapper};
use crate::events::Event;
use crate::service::{Node, NodeHandle, Termination, TerminationReason};
use crate::ServiceConfig;
use colored::*;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tap_control::TapFactory;
use tapmesh_shared::Error;

const COLLISION_ARCHIVE: &str = "identity.secret.saved_after_collision";

pub struct Supervisor {
    home: PathBuf,
    config: ServiceConfig,
    events: Sender<Event>,
    tap_factory: Arc<dyn TapFactory>,
    stack: Arc<dyn IpStack>,
    mapper: Option<Arc<dyn PortMapper>>,
    current: Mutex<Option<NodeHandle>>,
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(
        home: PathBuf,
        config: ServiceConfig,
        events: Sender<Event>,
        tap_factory: Arc<dyn TapFactory>,
        stack: Arc<dyn IpStack>,
        mapper: Option<Arc<dyn PortMapper>>,
    ) -> Self {
        Self {
            home,
            config,
            events,
            tap_factory,
            stack,
            mapper,
            current: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Runs the service until it terminates for any reason other than an
    /// identity collision. `make_engine` is called once per (re)start.
    pub fn run(&self, mut make_engine: impl FnMut() -> EngineFactory) -> Result<Termination, Error> {
        loop {
            let node = Node::start(
                &self.home,
                self.config.clone(),
                self.events.clone(),
                make_engine(),
                self.tap_factory.clone(),
                self.stack.clone(),
                self.mapper.clone(),
            )?;
            *self.current.lock() = Some(node.handle());

            let termination = node.wait();
            *self.current.lock() = None;

            if termination.reason != TerminationReason::IdentityCollision
                || self.stopping.load(Ordering::SeqCst)
            {
                return Ok(termination);
            }

            log::warn!(
                "{}",
                "identity collision: rotating identity and restarting".yellow()
            );
            if let Err(e) = self.rotate_identity() {
                return Err(anyhow::anyhow!("cannot rotate identity after collision: {e}"));
            }
            let _ = self.events.send(Event::NodeIdentityCollision);
        }
    }

    /// Requests shutdown of the currently running service instance, which
    /// makes `run` return.
    pub fn terminate(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().as_ref() {
            handle.terminate();
        }
    }

    fn rotate_identity(&self) -> io::Result<()> {
        let secret = self.home.join("identity.secret");
        let public = self.home.join("identity.public");

        match fs::rename(&secret, self.home.join(COLLISION_ARCHIVE)) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }
        match fs::remove_file(&public) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
