//! Cron mode
//!
//! Invokes every module's scheduler hook to collect periodic tasks, then
//! runs each non-manual task as a tokio interval loop. The first tick
//! fires immediately. A tick error is logged and the loop keeps going.
//! All loops share one watch-based shutdown signal; `shutdown` flips it
//! and joins the tasks.

use crate::app::App;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Periodic task body
pub type TaskFn = Arc<dyn Fn(App) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct TaskEntry {
    name: String,
    interval: Duration,
    manual: bool,
    run: TaskFn,
    handle: Option<JoinHandle<()>>,
}

/// Collects and runs periodic tasks
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<TaskEntry>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Scheduler {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Register a task that starts with the host
    pub fn task<F, Fut>(&mut self, name: &str, interval: Duration, body: F)
    where
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, interval, false, body);
    }

    /// Register a task that only runs when started explicitly through
    /// [`App::start_task`]
    pub fn manual_task<F, Fut>(&mut self, name: &str, interval: Duration, body: F)
    where
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, interval, true, body);
    }

    fn register<F, Fut>(&mut self, name: &str, interval: Duration, manual: bool, body: F)
    where
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let run: TaskFn =
            Arc::new(move |app| -> BoxFuture<'static, Result<()>> { Box::pin(body(app)) });
        self.tasks.push(TaskEntry {
            name: name.to_string(),
            interval,
            manual,
            run,
            handle: None,
        });
    }

    /// Registered task names, in registration order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Start every non-manual task; returns how many started
    pub(crate) fn start_auto(&mut self, app: &App) -> usize {
        let mut started = 0;
        for index in 0..self.tasks.len() {
            if !self.tasks[index].manual {
                self.spawn(app, index);
                started += 1;
            }
        }
        started
    }

    /// Start one task by name
    pub(crate) fn start(&mut self, app: &App, name: &str) -> Result<()> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| Error::InvalidState(format!("no task named '{}'", name)))?;
        if self.tasks[index].handle.is_some() {
            return Err(Error::InvalidState(format!(
                "task '{}' is already running",
                name
            )));
        }
        self.spawn(app, index);
        Ok(())
    }

    fn spawn(&mut self, app: &App, index: usize) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let entry = &mut self.tasks[index];
        let name = entry.name.clone();
        let interval = entry.interval;
        let run = entry.run.clone();
        let app = app.clone();

        debug!("Starting task '{}' (every {:?})", name, interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = (*run)(app.clone()).await {
                            error!("Task '{}' failed: {}", name, e);
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Task '{}' stopping", name);
                        break;
                    }
                }
            }
        });
        entry.handle = Some(handle);
    }

    /// Signal every loop and wait for them to finish
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for entry in &mut self.tasks {
            if let Some(handle) = entry.handle.take() {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!("Task '{}' panicked: {}", entry.name, e);
                    }
                }
            }
        }
    }
}

/// Collect scheduler hooks and start the non-manual tasks
pub(crate) fn start(app: &App) -> Result<()> {
    let mut scheduler = Scheduler::new();
    for (name, def) in &app.registry().modules {
        if let Some(hook) = &def.scheduler {
            debug!("Collecting tasks from module '{}'", name);
            hook(app, &mut scheduler);
        }
    }

    let total = scheduler.tasks.len();
    let auto = scheduler.start_auto(app);
    info!("✓ Scheduler running {} of {} registered tasks", auto, total);
    app.set_scheduler(scheduler);
    Ok(())
}
