//! [`IceSession`] shared between threads, with its timers driven by a tokio task

use crate::{Component, Error, IceEvent, IceRole, IceSession, ReceivedPkt};
use parking_lot::{Mutex, ReentrantMutex};
use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Instant,
};
use tokio::{sync::Notify, task::JoinHandle, time::sleep};

/// Receives the output of a [`SharedIceSession`]
///
/// Callbacks are invoked without the session being locked, so they may call back into the session.
pub trait IceHandler: Send + Sync + 'static {
    /// Send `data` from the socket bound to `source` to `target`
    fn on_send_pkt(
        &self,
        component: Component,
        source: SocketAddr,
        target: SocketAddr,
        data: Vec<u8>,
    );

    /// Non-STUN data was received
    fn on_rx_data(&self, component: Component, source: SocketAddr, data: Vec<u8>);

    /// Called exactly once with the outcome of the connectivity checks
    fn on_ice_complete(&self, result: Result<(), Error>);

    /// Events without a dedicated callback
    fn on_event(&self, event: IceEvent) {
        log::trace!("unhandled ICE event {event:?}");
    }
}

struct Shared {
    session: Mutex<IceSession>,
    handler: Box<dyn IceHandler>,
    /// Held while delivering events, so callbacks arrive in queue order no matter which thread dispatches.
    /// Reentrant because handlers may call back into the session.
    dispatching: ReentrantMutex<()>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Hand all queued events to the handler, one at a time and outside the session lock
    fn dispatch(&self) {
        let _dispatching = self.dispatching.lock();

        loop {
            let Some(event) = self.session.lock().pop_event() else {
                return;
            };

            match event {
                IceEvent::SendPacket {
                    component,
                    source,
                    target,
                    data,
                } => self.handler.on_send_pkt(component, source, target, data),
                IceEvent::ReceivedData {
                    component,
                    source,
                    data,
                } => self.handler.on_rx_data(component, source, data),
                IceEvent::Complete(result) => self.handler.on_ice_complete(result),
                event => self.handler.on_event(event),
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Cheaply cloneable handle to a mutex protected [`IceSession`]
#[derive(Clone)]
pub struct SharedIceSession {
    shared: Arc<Shared>,
}

impl SharedIceSession {
    /// Wrap the session and spawn the task driving its timers, must be called inside a tokio runtime
    pub fn new(session: IceSession, handler: impl IceHandler) -> Self {
        let wake = Arc::new(Notify::new());

        let shared = Arc::new(Shared {
            session: Mutex::new(session),
            handler: Box::new(handler),
            dispatching: ReentrantMutex::new(()),
            wake: wake.clone(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(drive(Arc::downgrade(&shared), wake));
        *shared.task.lock() = Some(task);

        Self { shared }
    }

    /// Run `f` with the locked session, then deliver the events it caused
    pub fn with<R>(&self, f: impl FnOnce(&mut IceSession) -> R) -> R {
        let ret = f(&mut self.shared.session.lock());

        self.shared.dispatch();
        self.shared.wake.notify_one();

        ret
    }

    pub fn role(&self) -> IceRole {
        self.shared.session.lock().role()
    }

    pub fn completion(&self) -> Option<Result<(), Error>> {
        self.shared.session.lock().completion().cloned()
    }

    pub fn start_check(&self) -> Result<(), Error> {
        self.with(|session| session.start_check(now()))
    }

    pub fn receive(&self, pkt: ReceivedPkt) -> Result<(), Error> {
        self.with(|session| session.receive(now(), pkt))
    }

    pub fn send_data(&self, component: Component, data: Vec<u8>) -> Result<(), Error> {
        self.with(|session| session.send_data(component, data))
    }

    pub fn abort(&self, reason: Error) -> Result<(), Error> {
        self.with(|session| session.abort(reason))
    }

    /// Destroy the session and stop the timer task
    pub fn destroy(&self) -> Result<(), Error> {
        self.shared.session.lock().destroy()?;

        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }

        Ok(())
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn drive(shared: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let timeout = {
            let mut session = shared.session.lock();
            let now = now();

            session.poll(now);
            session.timeout(now)
        };

        shared.dispatch();

        // Only the handle keeps the session alive
        drop(shared);

        match timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = sleep(timeout) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Candidate, IceConfig, IceCredentials};
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

    enum Output {
        Packet {
            component: Component,
            source: SocketAddr,
            target: SocketAddr,
            data: Vec<u8>,
        },
        Data(Vec<u8>),
        Complete(Result<(), Error>),
    }

    struct ChannelHandler(UnboundedSender<Output>);

    impl IceHandler for ChannelHandler {
        fn on_send_pkt(
            &self,
            component: Component,
            source: SocketAddr,
            target: SocketAddr,
            data: Vec<u8>,
        ) {
            let _ = self.0.send(Output::Packet {
                component,
                source,
                target,
                data,
            });
        }

        fn on_rx_data(&self, _: Component, _: SocketAddr, data: Vec<u8>) {
            let _ = self.0.send(Output::Data(data));
        }

        fn on_ice_complete(&self, result: Result<(), Error>) {
            let _ = self.0.send(Output::Complete(result));
        }
    }

    fn session(role: IceRole, local: SocketAddr) -> IceSession {
        let mut session = IceSession::new(IceConfig::default(), role);
        session.add_comp(Component::RTP, local).unwrap();
        session.gather_host_candidates().unwrap();
        session
    }

    fn route(
        output: Output,
        peer: &SharedIceSession,
        completions: &mut Vec<Result<(), Error>>,
        received: &mut Vec<Vec<u8>>,
    ) {
        match output {
            Output::Packet {
                component,
                source,
                target,
                data,
            } => {
                let _ = peer.receive(ReceivedPkt {
                    data,
                    source,
                    destination: target,
                    component,
                });
            }
            Output::Data(data) => received.push(data),
            Output::Complete(result) => completions.push(result),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shared_sessions_complete_once() {
        let _ = env_logger::builder().is_test(true).try_init();

        let a_addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b_addr: SocketAddr = "10.0.1.1:2000".parse().unwrap();

        let mut a_session = session(IceRole::Controlling, a_addr);
        let mut b_session = session(IceRole::Controlled, b_addr);

        let a_credentials = IceCredentials::random();
        let b_credentials = IceCredentials::random();
        a_session
            .set_credentials(a_credentials.clone(), b_credentials.clone())
            .unwrap();
        b_session
            .set_credentials(b_credentials, a_credentials)
            .unwrap();

        a_session
            .create_check_list(&[Candidate::host(Component::RTP, b_addr)])
            .unwrap();
        b_session
            .create_check_list(&[Candidate::host(Component::RTP, a_addr)])
            .unwrap();

        let (a_tx, mut a_rx) = unbounded_channel();
        let (b_tx, mut b_rx) = unbounded_channel();

        let a = SharedIceSession::new(a_session, ChannelHandler(a_tx));
        let b = SharedIceSession::new(b_session, ChannelHandler(b_tx));

        a.start_check().unwrap();
        b.start_check().unwrap();

        let mut a_completions = vec![];
        let mut b_completions = vec![];
        let mut a_data = vec![];
        let mut b_data = vec![];

        while a_completions.is_empty() || b_completions.is_empty() {
            tokio::select! {
                Some(output) = a_rx.recv() => route(output, &b, &mut a_completions, &mut a_data),
                Some(output) = b_rx.recv() => route(output, &a, &mut b_completions, &mut b_data),
                else => break,
            }
        }

        a.send_data(Component::RTP, b"hello".to_vec()).unwrap();

        // keep the timers running for a while, nothing completes twice
        let end = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            tokio::select! {
                Some(output) = a_rx.recv() => route(output, &b, &mut a_completions, &mut a_data),
                Some(output) = b_rx.recv() => route(output, &a, &mut b_completions, &mut b_data),
                _ = tokio::time::sleep_until(end) => break,
            }
        }

        assert_eq!(a_completions, [Ok(())]);
        assert_eq!(b_completions, [Ok(())]);
        assert_eq!(b_data, [b"hello".to_vec()]);
        assert_eq!(a.completion(), Some(Ok(())));

        a.destroy().unwrap();
        assert_eq!(a.destroy(), Err(Error::Destroyed));
        assert_eq!(
            a.send_data(Component::RTP, vec![]),
            Err(Error::Destroyed)
        );
    }

    struct Recorder(Arc<Mutex<Vec<(u8, u8)>>>);

    impl IceHandler for Recorder {
        fn on_send_pkt(&self, _: Component, _: SocketAddr, _: SocketAddr, _: Vec<u8>) {}

        fn on_rx_data(&self, _: Component, _: SocketAddr, data: Vec<u8>) {
            // give other threads a chance to overtake this callback
            std::thread::yield_now();
            self.0.lock().push((data[0], data[1]));
        }

        fn on_ice_complete(&self, _: Result<(), Error>) {}
    }

    #[tokio::test]
    async fn callbacks_keep_order_across_threads() {
        let received = Arc::new(Mutex::new(vec![]));
        let local: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let remote: SocketAddr = "10.0.1.1:2000".parse().unwrap();

        let shared = SharedIceSession::new(
            session(IceRole::Controlled, local),
            Recorder(received.clone()),
        );

        std::thread::scope(|scope| {
            for thread in 0..4u8 {
                let shared = shared.clone();

                scope.spawn(move || {
                    for seq in 0..50u8 {
                        shared
                            .receive(ReceivedPkt {
                                data: vec![thread, seq, 0, 0],
                                source: remote,
                                destination: local,
                                component: Component::RTP,
                            })
                            .unwrap();
                    }
                });
            }
        });

        let received = received.lock();
        assert_eq!(received.len(), 200);

        for thread in 0..4u8 {
            let seqs: Vec<u8> = received
                .iter()
                .filter(|(t, _)| *t == thread)
                .map(|(_, seq)| *seq)
                .collect();

            assert_eq!(seqs, (0..50).collect::<Vec<u8>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_reports_completion() {
        let (tx, mut rx) = unbounded_channel();

        let shared = SharedIceSession::new(
            session(IceRole::Controlling, "10.0.0.1:1000".parse().unwrap()),
            ChannelHandler(tx),
        );

        shared.abort(Error::Cancelled).unwrap();
        shared.abort(Error::Failed).unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Output::Complete(Err(Error::Cancelled)))
        ));
        assert!(rx.try_recv().is_err());
    }
}
