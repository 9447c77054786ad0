//! Session driver — wires a [`PeerSession`] to a byte stream and timers.
//!
//! Three tasks cooperate per connection:
//! - a reader task that pulls length-prefixed frames off the socket into a
//!   capacity-1 channel (so at most one frame is buffered ahead of flow
//!   control);
//! - the driver loop, which consumes frames only while flow control permits
//!   reading, runs the recurring liveness timer and the advert flush timer,
//!   and posts dispatches to the scheduler;
//! - a writer task that drains the session's outbound queue to the socket,
//!   honoring the drop mode (flush vs. abandon) on teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use keel_wire::{read_frame, write_frame, WireError};

use crate::registry::{SessionHandle, SessionToken, SharedRegistry};
use crate::scheduler::Scheduler;
use crate::session::{
    DropDirection, DropMode, PeerSession, SessionWaker, RECURRENT_TIMER_PERIOD,
};

/// How long teardown waits for a FLUSH_WRITE_QUEUE drain before giving up.
const FLUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Register a session and hand back its shared handle and token.
pub fn register_session(
    registry: &SharedRegistry,
    session: PeerSession,
) -> (SessionHandle, SessionToken) {
    let handle: SessionHandle = Arc::new(std::sync::Mutex::new(session));
    let token = registry
        .lock()
        .expect("session registry lock poisoned")
        .insert(handle.clone());
    handle
        .lock()
        .expect("session lock poisoned")
        .set_token(token);
    (handle, token)
}

/// Drive one connection to completion.
///
/// Returns once the session reaches CLOSING and its write queue is resolved
/// per the drop mode. The session is removed from the registry on the way
/// out, which invalidates every outstanding [`SessionToken`] copy.
pub async fn run_session<S>(
    stream: S,
    token: SessionToken,
    registry: SharedRegistry,
    scheduler: Scheduler,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(session) = lock_registry(&registry).get(token) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "session not registered",
        ));
    };

    let waker = SessionWaker::new();
    lock(&session).set_waker(waker.clone());

    let (reader, writer) = tokio::io::split(stream);
    let read_task = spawn_reader(reader);
    let write_task = spawn_writer(writer, session.clone(), waker.clone());
    let mut frame_rx = read_task.frames;

    lock(&session).on_connected(Instant::now());

    let mut tick = tokio::time::interval(RECURRENT_TIMER_PERIOD);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick completes immediately; skip it.
    tick.tick().await;

    loop {
        let (dropped, can_read, advert_deadline) = {
            let s = lock(&session);
            (
                s.drop_info().is_some(),
                s.can_read(),
                s.advert_flush_deadline(),
            )
        };
        if dropped {
            break;
        }
        let advert_sleep = advert_deadline.map(tokio::time::Instant::from_std);

        tokio::select! {
            _ = tick.tick() => {
                lock(&session).tick(Instant::now());
            }
            _ = waker.driver.notified() => {}
            _ = sleep_until_opt(advert_sleep), if advert_sleep.is_some() => {
                lock(&session).flush_advert(Instant::now());
            }
            frame = frame_rx.recv(), if can_read => {
                handle_incoming(frame, &session, token, &registry, &scheduler);
            }
        }
    }

    // Teardown: let the writer resolve the queue per drop mode, then detach.
    waker.writer.notify_one();
    let _ = tokio::time::timeout(FLUSH_DRAIN_TIMEOUT, write_task).await;
    read_task.handle.abort();
    lock_registry(&registry).remove(token);
    Ok(())
}

fn handle_incoming(
    frame: Option<Result<Vec<u8>, WireError>>,
    session: &SessionHandle,
    token: SessionToken,
    registry: &SharedRegistry,
    scheduler: &Scheduler,
) {
    let now = Instant::now();
    match frame {
        Some(Ok(body)) => {
            let dispatch = lock(session).handle_frame(&body, now);
            let Some(dispatch) = dispatch else {
                return;
            };
            let message = Arc::new(dispatch.message);
            let class = dispatch.class;
            let task_message = message.clone();
            let task_registry = registry.clone();
            let posted = scheduler.post(
                format!("{} recvMessage", dispatch.label),
                class,
                move || {
                    let handle = lock_registry(&task_registry).get(token);
                    match handle {
                        Some(handle) => {
                            lock(&handle).process_message(&task_message, class, Instant::now());
                        }
                        None => {
                            tracing::trace!(msg = %task_message.summary(), "session gone before dispatch");
                        }
                    }
                },
            );
            if !posted {
                lock(session).discard_dispatch(&message, now);
            }
        }
        Some(Err(WireError::Oversized { size, max })) => {
            lock(session).drop_peer(
                &format!("message too large: {size} > {max}"),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
        }
        Some(Err(e)) => {
            lock(session).drop_peer(
                &format!("connection closed: {e}"),
                DropDirection::RemoteDroppedUs,
                DropMode::IgnoreWriteQueue,
            );
        }
        None => {
            lock(session).drop_peer(
                "connection closed",
                DropDirection::RemoteDroppedUs,
                DropMode::IgnoreWriteQueue,
            );
        }
    }
}

struct ReadTask {
    frames: mpsc::Receiver<Result<Vec<u8>, WireError>>,
    handle: tokio::task::JoinHandle<()>,
}

fn spawn_reader<R>(mut reader: R) -> ReadTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut reader).await;
            let is_err = result.is_err();
            if tx.send(result).await.is_err() || is_err {
                break;
            }
        }
    });
    ReadTask { frames: rx, handle }
}

fn spawn_writer<W>(
    mut writer: W,
    session: SessionHandle,
    waker: SessionWaker,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let notified = waker.writer.notified();
            let (frame, abandon, closing) = {
                let mut s = lock(&session);
                let abandon = matches!(
                    s.drop_info().map(|d| d.mode),
                    Some(DropMode::IgnoreWriteQueue)
                );
                if abandon {
                    (None, true, true)
                } else {
                    let closing = s.should_abort();
                    (s.take_outbound(), false, closing)
                }
            };
            if abandon {
                break;
            }
            match frame {
                Some(frame) => {
                    if write_frame(&mut writer, &frame.bytes).await.is_err() {
                        lock(&session).drop_peer(
                            "write error",
                            DropDirection::RemoteDroppedUs,
                            DropMode::IgnoreWriteQueue,
                        );
                        break;
                    }
                    lock(&session).on_frame_written(frame.enqueued_at, Instant::now());
                }
                None if closing => break, // flush complete
                None => notified.await,
            }
        }
    })
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock(session: &SessionHandle) -> std::sync::MutexGuard<'_, PeerSession> {
    session.lock().expect("session lock poisoned")
}

fn lock_registry(
    registry: &SharedRegistry,
) -> std::sync::MutexGuard<'_, crate::registry::SessionRegistry> {
    registry.lock().expect("session registry lock poisoned")
}
