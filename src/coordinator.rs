//! NDT test coordinator.
//!
//! Owns the control channel: logs in, waits out the server queue, schedules
//! the sub-tests the server announces and routes every control message to the
//! active one. Sub-tests run strictly one after another.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Config;
use crate::download::DownloadTest;
use crate::emitter::Emitter;
use crate::error::{NdtError, Result};
use crate::message::{self, Message, MessageType, TestKind, TestSet};
use crate::meta::MetaTest;
use crate::params;
use crate::results::{Results, StateChange, rate_key};
use crate::transport::{Channel, Connector};
use crate::upload::UploadTest;

/// Coordinator states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Init,
    /// Waiting out the queue for `MSG_LOGIN`.
    LoginSent,
    /// Logged in; the next `MSG_LOGIN` lists the tests.
    WaitForTestIds,
    /// Sub-tests are scheduled or done; collecting `MSG_RESULTS`.
    WaitForMsgResults,
    Done,
    Failed,
}

/// Answer of a queue check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueueStatus {
    /// The server accepted the login right away.
    Ready,
    /// The server announced a wait of this many minutes.
    Queued { minutes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    QueueCheck,
}

enum Flow {
    Continue,
    LoggedOut,
    Queue(QueueStatus),
}

/// Whether a sub-test wants more control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Done,
}

/// Reports posted by data-channel tasks.
#[derive(Debug)]
pub(crate) enum Progress {
    Interval { test: TestKind, rate_kbps: f64 },
    Failed { test: TestKind, reason: String },
}

pub(crate) struct ProgressQueue {
    tx: mpsc::UnboundedSender<Progress>,
    rx: mpsc::UnboundedReceiver<Progress>,
}

impl ProgressQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ProgressQueue { tx, rx }
    }
}

/// A spawned data-channel task, aborted when dropped.
pub(crate) struct DataTask<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> DataTask<T> {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        DataTask {
            handle: tokio::spawn(task),
        }
    }

    pub(crate) async fn join(&mut self) -> Result<T> {
        (&mut self.handle)
            .await
            .map_err(|e| NdtError::ConnectionFailure(format!("data channel task failed: {e}")))
    }
}

impl<T> Drop for DataTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// What a sub-test may touch while handling a control message.
pub(crate) struct Context<'a, C: Connector> {
    pub connector: &'a C,
    pub control: &'a mut C::Channel,
    pub config: &'a Config,
    pub results: &'a mut Results,
    pub emitter: &'a mut dyn Emitter,
    pub progress: &'a mut ProgressQueue,
}

impl<C: Connector> Context<'_, C> {
    pub async fn send(&mut self, kind: MessageType, content: &str) -> Result<()> {
        let frame = message::encode_message(kind, content)?;
        self.control.send(frame).await
    }

    pub fn notify(&mut self, change: StateChange) {
        notify(self.emitter, change, self.results);
    }

    pub fn progress_sender(&self) -> mpsc::UnboundedSender<Progress> {
        self.progress.tx.clone()
    }

    /// Apply every progress report already queued.
    pub fn flush_progress(&mut self) -> Result<()> {
        while let Ok(update) = self.progress.rx.try_recv() {
            apply_progress(update, self.results, self.emitter)?;
        }
        Ok(())
    }

    /// Open a data channel to the port announced by `TEST_PREPARE`.
    pub async fn open_data_channel(&self, port: &str, subprotocol: &str) -> Result<C::Channel> {
        let port: u16 = port.trim().parse().map_err(|_| {
            NdtError::violation(format!("TEST_PREPARE carried an invalid port {port:?}"))
        })?;
        self.connector
            .open(&self.config.server, port, &self.config.path, subprotocol)
            .await
    }
}

fn notify(emitter: &mut dyn Emitter, change: StateChange, results: &Results) {
    debug!(state = %change, "state change");
    if let Err(e) = emitter.on_state_change(change, results) {
        warn!(error = %e, "emitter failed");
    }
}

fn apply_progress(update: Progress, results: &mut Results, emitter: &mut dyn Emitter) -> Result<()> {
    match update {
        Progress::Interval { test, rate_kbps } => {
            results.insert(rate_key(test), rate_kbps);
            notify(emitter, StateChange::Interval(test), results);
            Ok(())
        }
        Progress::Failed { test, reason } => Err(NdtError::ConnectionFailure(format!(
            "{} data channel: {reason}",
            test.label()
        ))),
    }
}

pub(crate) enum SubTest<C: Connector> {
    Upload(UploadTest<C::Channel>),
    Download(DownloadTest),
    Meta(MetaTest),
}

impl<C: Connector> SubTest<C> {
    fn new(kind: TestKind) -> Self {
        match kind {
            TestKind::C2s => SubTest::Upload(UploadTest::new()),
            TestKind::S2c => SubTest::Download(DownloadTest::new()),
            TestKind::Meta => SubTest::Meta(MetaTest::new()),
        }
    }

    fn kind(&self) -> TestKind {
        match self {
            SubTest::Upload(_) => TestKind::C2s,
            SubTest::Download(_) => TestKind::S2c,
            SubTest::Meta(_) => TestKind::Meta,
        }
    }

    async fn handle(&mut self, msg: &Message, ctx: &mut Context<'_, C>) -> Result<Step> {
        match self {
            SubTest::Upload(test) => test.handle(msg, ctx).await,
            SubTest::Download(test) => test.handle(msg, ctx).await,
            SubTest::Meta(test) => test.handle(msg, ctx).await,
        }
    }
}

/// Drives one test run against one server. Create a fresh coordinator per run.
pub struct Coordinator<C: Connector, E: Emitter> {
    connector: C,
    emitter: E,
    config: Config,
    mode: Mode,
    state: CoordinatorState,
    results: Results,
    active: Option<SubTest<C>>,
    // popped from the back: the first announced test sits last
    queued: Vec<SubTest<C>>,
    announced: TestSet,
}

impl<C: Connector, E: Emitter> Coordinator<C, E> {
    /// A coordinator that has not touched the network yet.
    pub fn new(connector: C, config: Config, emitter: E) -> Self {
        Coordinator {
            connector,
            emitter,
            config,
            mode: Mode::Run,
            state: CoordinatorState::Init,
            results: Results::new(),
            active: None,
            queued: Vec::new(),
            announced: TestSet::empty(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Variables collected so far; still populated after a failed run.
    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn into_results(self) -> Results {
        self.results
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    /// Tests the server announced after login; empty before that.
    pub fn announced(&self) -> TestSet {
        self.announced
    }

    /// Sub-tests still to run, in execution order.
    pub fn scheduled(&self) -> Vec<TestKind> {
        self.active
            .iter()
            .chain(self.queued.iter().rev())
            .map(SubTest::kind)
            .collect()
    }

    /// Run every test the server schedules.
    ///
    /// Reports through the emitter: `on_start`, state changes, then exactly
    /// one of `on_finish` or `on_error`.
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_fresh()?;
        info!(server = %self.config.server, port = self.config.port, "starting NDT test");
        if let Err(e) = self.emitter.on_start(&self.config.server) {
            warn!(error = %e, "emitter failed");
        }

        match self.drive().await {
            Ok(_) => {
                notify(&mut self.emitter, StateChange::FinishedAll, &self.results);
                if let Err(e) = self.emitter.on_finish(&self.results) {
                    warn!(error = %e, "emitter failed");
                }
                info!("all tests successfully completed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, state = ?self.state, "test failed");
                self.abort();
                if let Err(emit_err) = self.emitter.on_error(&e.to_string()) {
                    warn!(error = %emit_err, "emitter failed");
                }
                Err(e)
            }
        }
    }

    /// Log in and report whether the server would queue us, without testing.
    pub async fn check_queue(&mut self) -> Result<QueueStatus> {
        self.ensure_fresh()?;
        self.mode = Mode::QueueCheck;
        match self.drive().await {
            Ok(Some(status)) => {
                self.state = CoordinatorState::Done;
                Ok(status)
            }
            Ok(None) => {
                self.abort();
                Err(NdtError::violation("server logged out before answering the queue check"))
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.state != CoordinatorState::Init {
            return Err(NdtError::violation(format!(
                "coordinator already used (state {:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.state = CoordinatorState::Failed;
        // dropping sub-tests aborts their data-channel tasks
        self.active = None;
        self.queued.clear();
    }

    async fn drive(&mut self) -> Result<Option<QueueStatus>> {
        match self.config.timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.session())
                .await
                .unwrap_or(Err(NdtError::Timeout)),
            None => self.session().await,
        }
    }

    async fn session(&mut self) -> Result<Option<QueueStatus>> {
        let mut control = self
            .connector
            .open(
                &self.config.server,
                self.config.port,
                &self.config.path,
                params::CONTROL_SUBPROTOCOL,
            )
            .await?;
        debug!(port = self.config.port, "opened control channel");

        let mut progress = ProgressQueue::new();
        let outcome = self.exchange(&mut control, &mut progress).await;
        if let Err(e) = control.close().await {
            debug!(error = %e, "closing control channel failed");
        }
        outcome
    }

    async fn exchange(
        &mut self,
        control: &mut C::Channel,
        progress: &mut ProgressQueue,
    ) -> Result<Option<QueueStatus>> {
        control
            .send(message::encode_login(self.config.tests)?)
            .await?;
        self.state = CoordinatorState::LoginSent;

        loop {
            tokio::select! {
                frame = control.recv() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => {
                            return Err(NdtError::ConnectionFailure(format!(
                                "control channel closed in state {:?}",
                                self.state
                            )));
                        }
                    };
                    match self.on_frame(control, progress, frame).await? {
                        Flow::Continue => {}
                        Flow::LoggedOut => return Ok(None),
                        Flow::Queue(status) => return Ok(Some(status)),
                    }
                }
                Some(update) = progress.rx.recv() => {
                    apply_progress(update, &mut self.results, &mut self.emitter)?;
                }
            }
        }
    }

    async fn on_frame(
        &mut self,
        control: &mut C::Channel,
        progress: &mut ProgressQueue,
        frame: Bytes,
    ) -> Result<Flow> {
        let msg = message::decode_message(&frame)?;
        debug!(kind = %msg.kind, state = ?self.state, body = msg.msg(), "received message");

        if let Some(active) = self.active.as_mut() {
            let mut ctx = Context {
                connector: &self.connector,
                control,
                config: &self.config,
                results: &mut self.results,
                emitter: &mut self.emitter,
                progress,
            };
            if active.handle(&msg, &mut ctx).await? == Step::Done {
                debug!(test = %active.kind(), "subtest complete");
                self.active = self.queued.pop();
            }
            return Ok(Flow::Continue);
        }

        match (self.state, msg.kind) {
            (CoordinatorState::LoginSent, MessageType::SrvQueue) => {
                self.on_queue(control, msg.msg()).await
            }
            (CoordinatorState::LoginSent, MessageType::MsgLogin) => {
                if !msg.msg().starts_with('v') {
                    warn!(banner = msg.msg(), "login banner does not carry a server version");
                } else {
                    debug!(version = msg.msg(), "logged in");
                }
                if self.mode == Mode::QueueCheck {
                    return Ok(Flow::Queue(QueueStatus::Ready));
                }
                self.state = CoordinatorState::WaitForTestIds;
                Ok(Flow::Continue)
            }
            (CoordinatorState::LoginSent, kind) => Err(NdtError::violation(format!(
                "unexpected message while awaiting login: expected SRV_QUEUE or MSG_LOGIN, got {kind}"
            ))),
            (CoordinatorState::WaitForTestIds, MessageType::MsgLogin) => {
                self.schedule(msg.msg())?;
                self.state = CoordinatorState::WaitForMsgResults;
                Ok(Flow::Continue)
            }
            (CoordinatorState::WaitForMsgResults, MessageType::MsgResults) => {
                self.results.merge_lines(msg.msg());
                Ok(Flow::Continue)
            }
            (CoordinatorState::WaitForMsgResults, MessageType::MsgLogout) => {
                self.state = CoordinatorState::Done;
                Ok(Flow::LoggedOut)
            }
            (state, kind) => Err(NdtError::violation(format!(
                "no handler for message {kind} in state {state:?}"
            ))),
        }
    }

    async fn on_queue(&mut self, control: &mut C::Channel, body: &str) -> Result<Flow> {
        match body {
            params::SRV_QUEUE_HEARTBEAT => {
                control
                    .send(message::encode_message(MessageType::MsgWaiting, "")?)
                    .await?;
                debug!("answered queue keepalive");
            }
            params::SRV_QUEUE_SERVER_FAULT => return Err(NdtError::ServerAbort),
            wait => {
                debug!(wait, "queued by server, waiting for MSG_LOGIN");
                if self.mode == Mode::QueueCheck
                    && let Ok(minutes) = wait.trim().parse::<u32>()
                    && minutes > 0
                {
                    return Ok(Flow::Queue(QueueStatus::Queued { minutes }));
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn schedule(&mut self, ids: &str) -> Result<()> {
        let kinds = message::parse_test_ids(ids)?;
        info!(tests = ids, "server scheduled tests");

        self.announced = kinds.iter().copied().collect();
        let unrequested = self.announced.difference(self.config.tests);
        if !unrequested.is_empty() {
            warn!(
                announced = self.announced.bits(),
                requested = self.config.tests.bits(),
                unrequested = unrequested.bits(),
                "server scheduled tests that were not requested"
            );
        }

        self.queued.extend(kinds.into_iter().rev().map(SubTest::new));
        self.active = self.queued.pop();
        Ok(())
    }
}

/// `8 * bytes / 1000 / seconds`, or zero when no time has passed.
pub(crate) fn throughput_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        8.0 * bytes as f64 / 1000.0 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::message::TestSet;
    use crate::results::{C2S_CLIENT_RATE, C2S_RATE, S2C_RATE, S2C_SERVER_RATE};
    use crate::transport::mock::{MockConnector, ServerEnd};

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Emitter for Recorder {
        fn on_start(&mut self, server: &str) -> Result<()> {
            self.push(format!("start {server}"));
            Ok(())
        }

        fn on_state_change(&mut self, change: StateChange, _results: &Results) -> Result<()> {
            self.push(change.label());
            Ok(())
        }

        fn on_finish(&mut self, _results: &Results) -> Result<()> {
            self.push("finish".into());
            Ok(())
        }

        fn on_error(&mut self, err: &str) -> Result<()> {
            self.push(format!("error {err}"));
            Ok(())
        }
    }

    fn setup(
        tests: TestSet,
        timeout: Option<Duration>,
    ) -> (
        Coordinator<MockConnector, Recorder>,
        mpsc::UnboundedReceiver<ServerEnd>,
        Recorder,
    ) {
        let (connector, opened) = MockConnector::new();
        let mut config = Config::new("ndt.example.net");
        config.tests = tests;
        config.timeout = timeout;
        config.client_name = "test-app".into();
        config.client_version = "1.0".into();
        let recorder = Recorder::default();
        (Coordinator::new(connector, config, recorder.clone()), opened, recorder)
    }

    fn raw_frame(kind: MessageType, body: serde_json::Value) -> Vec<u8> {
        let body = serde_json::to_vec(&body).unwrap();
        let mut frame = vec![kind as u8, (body.len() >> 8) as u8, body.len() as u8];
        frame.extend_from_slice(&body);
        frame
    }

    /// Accept the control channel and log the client in.
    async fn login(opened: &mut mpsc::UnboundedReceiver<ServerEnd>, tests: &str) -> ServerEnd {
        let mut control = opened.recv().await.unwrap();
        assert_eq!(control.subprotocol, params::CONTROL_SUBPROTOCOL);
        assert_eq!(control.port, params::DEFAULT_PORT);
        assert_eq!(control.path, params::DEFAULT_PATH);

        let login = control.next().await;
        assert_eq!(login.kind, MessageType::MsgExtendedLogin);
        assert_eq!(login.msg(), "v3.5.5");

        control.send(MessageType::SrvQueue, "0");
        control.send(MessageType::MsgLogin, "v3.5.5");
        control.send(MessageType::MsgLogin, tests);
        control
    }

    async fn serve_upload(
        control: &mut ServerEnd,
        opened: &mut mpsc::UnboundedReceiver<ServerEnd>,
    ) -> u64 {
        control.send(MessageType::TestPrepare, "3002");
        let mut data = opened.recv().await.unwrap();
        assert_eq!(data.subprotocol, params::C2S_SUBPROTOCOL);
        assert_eq!(data.port, 3002);

        control.send(MessageType::TestStart, "");
        let mut bytes = 0u64;
        while let Some(frame) = data.rx.recv().await {
            bytes += frame.len() as u64;
        }
        control.send(MessageType::TestMsg, "12345");
        control.send(MessageType::TestFinalize, "");
        bytes
    }

    #[tokio::test(start_paused = true)]
    async fn upload_only_run() {
        let (mut coordinator, mut opened, recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            let login = control.next().await;
            let tests: u32 = login.field("tests").unwrap().parse().unwrap();
            assert_eq!(tests, 2 | 16);

            control.send(MessageType::SrvQueue, params::SRV_QUEUE_HEARTBEAT);
            let reply = control.next().await;
            assert_eq!(reply.kind, MessageType::MsgWaiting);
            assert_eq!(reply.msg(), "");

            control.send(MessageType::SrvQueue, "0");
            control.send(MessageType::MsgLogin, "v3.5.5");
            control.send(MessageType::MsgLogin, "2");
            let uploaded = serve_upload(&mut control, &mut opened).await;
            control.send(MessageType::MsgResults, "MinRTT: 5\nMaxRTT: 20\n");
            control.send(MessageType::MsgLogout, "");

            // exactly one MSG_WAITING: nothing else arrives before the close
            assert!(control.rx.recv().await.is_none());
            uploaded
        };

        let (outcome, uploaded) = tokio::join!(coordinator.run(), server);
        outcome.unwrap();

        assert!(uploaded > 0);
        assert_eq!(coordinator.state(), CoordinatorState::Done);
        let results = coordinator.results();
        assert_eq!(results.number(C2S_RATE), Some(12345.0));
        assert!(results.number(C2S_CLIENT_RATE).unwrap() > 0.0);
        assert_eq!(results.text("MinRTT"), Some("5"));
        assert_eq!(results.text("MaxRTT"), Some("20"));

        let events = recorder.events();
        assert_eq!(events.first().map(String::as_str), Some("start ndt.example.net"));
        assert!(events.iter().any(|e| e == "interval_c2s"));
        let tail: Vec<&str> = events.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, ["finish", "finished_all", "finished_c2s"]);
        assert_eq!(events.iter().filter(|e| *e == "finish").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tests_in_announced_order() {
        let tests = TestSet::C2S | TestSet::S2C | TestSet::META;
        let (mut coordinator, mut opened, recorder) = setup(tests, None);

        let server = async move {
            let mut control = login(&mut opened, "2 4 32").await;
            serve_upload(&mut control, &mut opened).await;

            control.send(MessageType::TestPrepare, "3003");
            let s2c = opened.recv().await.unwrap();
            assert_eq!(s2c.subprotocol, params::S2C_SUBPROTOCOL);
            control.send(MessageType::TestStart, "");
            for _ in 0..10 {
                s2c.tx.send(Ok(Bytes::from(vec![0u8; 8192]))).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            drop(s2c);
            tokio::time::sleep(Duration::from_millis(10)).await;

            control.send_raw(raw_frame(
                MessageType::TestMsg,
                json!({
                    "msg": "655.1",
                    "ThroughputValue": "655.1",
                    "UnsentDataAmount": "0",
                    "TotalSentByte": "81920",
                }),
            ));
            let reply = control.next().await;
            assert_eq!(reply.kind, MessageType::TestMsg);
            let client_rate: f64 = reply.msg().parse().unwrap();
            control.send(MessageType::TestMsg, "CurMSS: 1448\n");
            control.send(MessageType::TestFinalize, "");

            control.send(MessageType::TestPrepare, "");
            control.send(MessageType::TestStart, "");
            let entry = control.next().await;
            assert_eq!(entry.kind, MessageType::TestMsg);
            assert_eq!(entry.msg(), "client.application:test-app/1.0");
            assert_eq!(control.next().await.msg(), "");
            control.send(MessageType::TestFinalize, "");

            control.send(MessageType::MsgResults, "avgrtt: 12.5");
            control.send(MessageType::MsgLogout, "");
            client_rate
        };

        let (outcome, client_rate) = tokio::join!(coordinator.run(), server);
        outcome.unwrap();

        let results = coordinator.results();
        assert!(client_rate > 0.0);
        assert_eq!(results.number(S2C_RATE), Some(client_rate));
        assert_eq!(results.text(S2C_SERVER_RATE), Some("655.1"));
        assert_eq!(results.text("CurMSS"), Some("1448"));
        assert_eq!(results.text("avgrtt"), Some("12.5"));

        let milestones: Vec<String> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("preparing_") || e.starts_with("finished_"))
            .collect();
        assert_eq!(
            milestones,
            [
                "preparing_c2s",
                "finished_c2s",
                "preparing_s2c",
                "finished_s2c",
                "preparing_meta",
                "finished_meta",
                "finished_all",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queue_abort_fails_the_run() {
        let (mut coordinator, mut opened, recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control.send(MessageType::SrvQueue, params::SRV_QUEUE_SERVER_FAULT);
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::ServerAbort)));
        assert_eq!(coordinator.state(), CoordinatorState::Failed);

        let events = recorder.events();
        assert!(events.last().unwrap().starts_with("error"));
        assert!(!events.iter().any(|e| e == "finish"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_message_type_is_violation() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control.send_raw(vec![99, 0, 2, b'{', b'}']);
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::ProtocolViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_message_type_during_subtest_stops_it() {
        let (mut coordinator, mut opened, recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let control = login(&mut opened, "2").await;
            control.send_raw(vec![99, 0, 2, b'{', b'}']);
            control.send(MessageType::TestPrepare, "3002");
            (control, opened)
        };

        let (outcome, (_control, mut opened)) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::ProtocolViolation(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
        assert!(opened.try_recv().is_err(), "a data channel was opened");
        assert!(!recorder.events().iter().any(|e| e == "preparing_c2s"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_message_type_while_collecting_results_keeps_partial_results() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let control = login(&mut opened, "").await;
            control.send(MessageType::MsgResults, "MinRTT: 5");
            control.send_raw(vec![99, 0, 2, b'{', b'}']);
            control.send(MessageType::MsgResults, "MaxRTT: 20");
            control.send(MessageType::MsgLogout, "");
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::ProtocolViolation(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
        let results = coordinator.results();
        assert_eq!(results.text("MinRTT"), Some("5"));
        assert_eq!(results.text("MaxRTT"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn odd_login_banner_still_logs_in() {
        let (mut coordinator, mut opened, recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control.send(MessageType::MsgLogin, "3.7.0");
            control.send(MessageType::MsgLogin, "");
            control.send(MessageType::MsgLogout, "");
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        outcome.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Done);
        assert!(recorder.events().iter().any(|e| e == "finish"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_test_id_is_violation() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move { login(&mut opened, "2 64").await };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        match outcome {
            Err(NdtError::ProtocolViolation(msg)) => assert!(msg.contains("64"), "{msg}"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(coordinator.scheduled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_subtest_message_is_violation() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let control = login(&mut opened, "2").await;
            control.send(MessageType::TestStart, "");
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::ProtocolViolation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn control_channel_closing_early_is_connection_failure() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
        };

        let (outcome, _) = tokio::join!(coordinator.run(), server);
        assert!(outcome.unwrap_err().is_connection_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn download_channel_error_fails_the_run() {
        let (mut coordinator, mut opened, recorder) = setup(TestSet::S2C, None);

        let server = async move {
            let control = login(&mut opened, "4").await;
            control.send(MessageType::TestPrepare, "3003");
            let s2c = opened.recv().await.unwrap();
            control.send(MessageType::TestStart, "");
            tokio::time::sleep(Duration::from_millis(10)).await;
            s2c.tx
                .send(Err(NdtError::ConnectionFailure("reset by peer".into())))
                .unwrap();
            (control, s2c)
        };

        let (outcome, _ends) = tokio::join!(coordinator.run(), server);
        let err = outcome.unwrap_err();
        assert!(err.is_connection_failure(), "{err}");
        assert!(recorder.events().iter().any(|e| e == "running_s2c"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline() {
        let (mut coordinator, mut opened, _recorder) =
            setup(TestSet::C2S, Some(Duration::from_secs(5)));

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control
        };

        let (outcome, _control) = tokio::join!(coordinator.run(), server);
        assert!(matches!(outcome, Err(NdtError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_check_ready() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control.send(MessageType::SrvQueue, params::SRV_QUEUE_HEARTBEAT);
            assert_eq!(control.next().await.kind, MessageType::MsgWaiting);
            control.send(MessageType::MsgLogin, "v3.5.5");
            // the client hangs up instead of waiting for tests
            assert!(control.rx.recv().await.is_none());
        };

        let (status, _) = tokio::join!(coordinator.check_queue(), server);
        assert_eq!(status.unwrap(), QueueStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_check_queued() {
        let (mut coordinator, mut opened, _recorder) = setup(TestSet::C2S, None);

        let server = async move {
            let mut control = opened.recv().await.unwrap();
            control.next().await;
            control.send(MessageType::SrvQueue, "3");
            control
        };

        let (status, _control) = tokio::join!(coordinator.check_queue(), server);
        assert_eq!(status.unwrap(), QueueStatus::Queued { minutes: 3 });
    }

    #[test]
    fn schedules_one_subtest_per_announced_id() {
        let (mut coordinator, _opened, _recorder) = setup(TestSet::C2S, None);
        coordinator.schedule("2 4 32").unwrap();
        assert_eq!(
            coordinator.scheduled(),
            [TestKind::C2s, TestKind::S2c, TestKind::Meta]
        );
        assert_eq!(
            coordinator.announced(),
            TestSet::C2S | TestSet::S2C | TestSet::META
        );
    }

    #[test]
    fn unrequested_announced_tests_are_still_scheduled() {
        let (mut coordinator, _opened, _recorder) = setup(TestSet::C2S, None);
        assert!(coordinator.announced().is_empty());

        coordinator.schedule("4 2").unwrap();
        assert_eq!(coordinator.announced(), TestSet::C2S | TestSet::S2C);
        assert_eq!(
            coordinator.announced().difference(TestSet::C2S.with_status()),
            TestSet::S2C
        );
        assert_eq!(coordinator.scheduled(), [TestKind::S2c, TestKind::C2s]);
    }

    #[tokio::test]
    async fn coordinator_runs_once() {
        let (mut coordinator, _opened, _recorder) = setup(TestSet::C2S, None);
        coordinator.state = CoordinatorState::Done;
        assert!(matches!(
            coordinator.run().await,
            Err(NdtError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn throughput_in_kbit_per_second() {
        assert_eq!(throughput_kbps(1_000_000, Duration::from_secs(1)), 8000.0);
        assert_eq!(throughput_kbps(1_000_000, Duration::ZERO), 0.0);
    }
}
