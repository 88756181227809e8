//! A `Worker` is the single owner of one instrument connection. It keeps the session, the
//! driver with its cache and the values shown on the front panel, and runs every request of
//! a shot cycle against them. Callers talk to it through a `WorkerHandle`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::config::DeviceConfig;
use crate::driver::{self, Driver, Values};
use crate::iotask::{IoHandler, IoTask};
use crate::session::{Session, SessionOptions};
use crate::status::StatusReport;
use crate::Error;
use labinstr_protocol::{DataGroup, DeviceGroup, ShotFile};

pub const STATUS_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    ProgramManual(Values),
    CheckRemoteValues,
    TransitionToBuffered { shot: PathBuf, fresh: bool },
    TransitionToManual,
    Abort,
    CheckStatus,
    Clear,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Values(Values),
    Status(StatusReport),
    Done,
}

pub struct Worker {
    name: String,
    address: Option<Address>,
    options: SessionOptions,
    session: Option<Session>,
    ready: bool,
    driver: Box<dyn Driver>,
    front_panel: Values,
    final_values: Values,
    shot: Option<PathBuf>,
}

impl Worker {
    pub fn new(device: &DeviceConfig) -> crate::Result<Self> {
        let address = device.address()?;
        let profile = device.profile()?;
        let options = profile.connection.session_options();
        let driver = driver::create(&device.name, profile, device.update_mode);
        Ok(Self {
            name: device.name.clone(),
            address: Some(address),
            options,
            session: None,
            ready: false,
            driver,
            front_panel: Values::new(),
            final_values: Values::new(),
            shot: None,
        })
    }

    /// A worker for an already open session. It cannot reconnect once the session is lost.
    pub fn from_session(name: &str, session: Session, driver: Box<dyn Driver>) -> Self {
        Self {
            name: name.to_string(),
            address: None,
            options: session.options().clone(),
            session: Some(session),
            ready: false,
            driver,
            front_panel: Values::new(),
            final_values: Values::new(),
            shot: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn front_panel(&self) -> &Values {
        &self.front_panel
    }

    /// Opens the session if needed and initializes the instrument once per session.
    async fn connect(&mut self) -> crate::Result<()> {
        let connected = self.session.as_ref().map(|x| x.is_open()).unwrap_or(false);
        if !connected {
            let address = self
                .address
                .as_ref()
                .ok_or_else(|| Error::argument(anyhow!("{} has no address to reconnect to", self.name)))?;
            self.session = Some(Session::open(address, self.options.clone()).await?);
            self.ready = false;
        }
        let session = self.session.as_mut().ok_or_else(Error::closed)?;
        if !self.ready {
            self.driver.init(session).await?;
            self.ready = true;
            log::info!("{}: initialized", self.name);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.ready = false;
    }

    fn load_group(&self, path: &Path) -> crate::Result<DeviceGroup> {
        let shot = ShotFile::load(path)?;
        match shot.device(&self.name) {
            Some(x) => Ok(x.clone()),
            None => {
                log::debug!("{}: not used in {}", self.name, path.display());
                Ok(DeviceGroup::default())
            }
        }
    }

    fn store_data(&self, path: &Path, data: DataGroup) -> crate::Result<()> {
        if data.traces.is_empty() && data.results.is_empty() {
            return Ok(());
        }
        let mut shot = ShotFile::load(path)?;
        for (label, trace) in data.traces {
            shot.insert_trace(label, trace);
        }
        for (device, results) in data.results {
            shot.insert_results(&device, results);
        }
        shot.save(path)
    }

    async fn dispatch(&mut self, req: Request) -> crate::Result<Response> {
        match req {
            Request::ProgramManual(values) => {
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                let ret = self.driver.program_manual(session, &values).await?;
                self.front_panel.extend(ret.iter().map(|(k, v)| (k.clone(), *v)));
                Ok(Response::Values(ret))
            }
            Request::CheckRemoteValues => {
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                let ret = self.driver.check_remote_values(session).await?;
                Ok(Response::Values(ret))
            }
            Request::TransitionToBuffered { shot, fresh } => {
                let group = self.load_group(&shot)?;
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                log::info!("{}: transition to buffered (fresh = {})", self.name, fresh);
                let initial = self.front_panel.clone();
                let ret = self
                    .driver
                    .transition_to_buffered(session, &group, &initial, fresh)
                    .await?;
                self.final_values = ret.clone();
                self.shot = Some(shot);
                Ok(Response::Values(ret))
            }
            Request::TransitionToManual => {
                let shot = self
                    .shot
                    .take()
                    .ok_or_else(|| Error::argument(anyhow!("{} is not in buffered mode", self.name)))?;
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                log::info!("{}: transition to manual", self.name);
                let data = self.driver.transition_to_manual(session, false).await?;
                self.store_data(&shot, data)?;
                self.front_panel = std::mem::take(&mut self.final_values);
                Ok(Response::Values(self.front_panel.clone()))
            }
            Request::Abort => {
                self.final_values.clear();
                if self.shot.take().is_none() {
                    return Ok(Response::Values(self.front_panel.clone()));
                }
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                log::warn!("{}: aborting shot", self.name);
                self.driver.transition_to_manual(session, true).await?;
                Ok(Response::Values(self.front_panel.clone()))
            }
            Request::CheckStatus => {
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                Ok(Response::Status(self.driver.check_status(session).await?))
            }
            Request::Clear => {
                self.connect().await?;
                let session = self.session.as_mut().ok_or_else(Error::closed)?;
                self.driver.clear(session).await?;
                Ok(Response::Done)
            }
            Request::Shutdown => {
                self.close().await;
                Ok(Response::Done)
            }
        }
    }
}

#[async_trait]
impl IoHandler for Worker {
    type Request = Request;
    type Response = Response;

    async fn handle(&mut self, req: Request) -> crate::Result<Response> {
        let ret = self.dispatch(req).await;
        if let Err(err) = &ret {
            log::error!("{}: {}", self.name, err);
            if !err.is_compile_time() {
                // the instrument state is unknown now, reprogram everything next time
                self.driver.invalidate_cache();
            }
            if err.resets_connection() {
                self.close().await;
            }
        }
        ret
    }

    async fn shutdown(&mut self) {
        self.close().await;
    }
}

fn unexpected(response: Response) -> Error {
    Error::internal(anyhow!("Unexpected worker response {:?}", response))
}

#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    task: IoTask<Worker>,
}

impl WorkerHandle {
    pub fn spawn(worker: Worker) -> Self {
        Self {
            name: worker.name.clone(),
            task: IoTask::new(worker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    async fn values(&self, req: Request) -> crate::Result<Values> {
        match self.task.request(req).await? {
            Response::Values(x) => Ok(x),
            x => Err(unexpected(x)),
        }
    }

    async fn done(&self, req: Request) -> crate::Result<()> {
        match self.task.request(req).await? {
            Response::Done => Ok(()),
            x => Err(unexpected(x)),
        }
    }

    pub async fn program_manual(&self, values: Values) -> crate::Result<Values> {
        self.values(Request::ProgramManual(values)).await
    }

    pub async fn check_remote_values(&self) -> crate::Result<Values> {
        self.values(Request::CheckRemoteValues).await
    }

    pub async fn transition_to_buffered<P: Into<PathBuf>>(&self, shot: P, fresh: bool) -> crate::Result<Values> {
        self.values(Request::TransitionToBuffered {
            shot: shot.into(),
            fresh,
        })
        .await
    }

    pub async fn transition_to_manual(&self) -> crate::Result<Values> {
        self.values(Request::TransitionToManual).await
    }

    pub async fn abort(&self) -> crate::Result<Values> {
        self.values(Request::Abort).await
    }

    pub async fn check_status(&self) -> crate::Result<StatusReport> {
        match self.task.request(Request::CheckStatus).await? {
            Response::Status(x) => Ok(x),
            x => Err(unexpected(x)),
        }
    }

    pub async fn clear(&self) -> crate::Result<()> {
        self.done(Request::Clear).await
    }

    /// Closes the session. Requests sent afterwards reconnect.
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.done(Request::Shutdown).await
    }

    pub fn disconnect(&self) {
        self.task.disconnect()
    }
}

/// Polls the status of a device until its worker goes away. Requests are queued behind
/// whatever the worker is doing, so polling never interleaves with a shot.
pub fn spawn_status_monitor(handle: WorkerHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if !handle.is_alive() {
                break;
            }
            match handle.check_status().await {
                Ok(report) => {
                    let set: Vec<_> = report.flags.iter().filter(|x| x.set).map(|x| x.label.as_str()).collect();
                    log::debug!("{}: status {:#04x} {:?}", handle.name(), report.register, set);
                }
                Err(Error::Argument(_)) => {
                    log::debug!("{}: no status to monitor", handle.name());
                    break;
                }
                Err(err) => log::warn!("{}: status check failed: {}", handle.name(), err),
            }
        }
    })
}
