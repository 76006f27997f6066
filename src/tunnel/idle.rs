//! Idle-timeout facility for tunneled streams
//!
//! Wraps a stream (typically an SSH channel stream) with a deadline that
//! fires only after a period with no successful I/O in either direction, and
//! auto-extends on every byte transferred. This lets `copy`-style loops run
//! over an SSH channel with a true-inactivity timeout and no per-iteration
//! deadline resets.
//!
//! A timeout surfaces as an `io::Error` whose kind is `TimedOut` — never as
//! EOF — and the stream stays open: after re-arming the timer (canonically
//! `set_idle_timeout(Duration::ZERO)`, then a new duration if desired) reads
//! and writes proceed again. Re-arming is safe from any task, including one
//! other than the blocked reader.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// Distinguishes idle-timeout errors from every other I/O failure.
pub trait IsTimeout {
    fn is_timeout(&self) -> bool;
}

impl IsTimeout for io::Error {
    fn is_timeout(&self) -> bool {
        self.kind() == io::ErrorKind::TimedOut
    }
}

fn idle_expired() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "idle timeout expired")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Read,
    Write,
}

impl Dir {
    fn other(self) -> Dir {
        match self {
            Dir::Read => Dir::Write,
            Dir::Write => Dir::Read,
        }
    }
}

#[derive(Default)]
struct TimerState {
    /// Zero means disabled
    timeout: Duration,
    /// Armed deadline; `None` while disabled
    deadline: Option<Instant>,
    /// Sticky once the deadline passes; cleared only by `set_idle_timeout`
    expired: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl TimerState {
    fn store_waker(&mut self, dir: Dir, waker: &Waker) {
        let slot = match dir {
            Dir::Read => &mut self.read_waker,
            Dir::Write => &mut self.write_waker,
        };
        match slot {
            Some(w) if w.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn take_waker(&mut self, dir: Dir) -> Option<Waker> {
        match dir {
            Dir::Read => self.read_waker.take(),
            Dir::Write => self.write_waker.take(),
        }
    }
}

/// Concurrently settable idle deadline shared by both directions of a
/// wrapped stream. Cloning yields another handle to the same timer, which is
/// how a different task re-arms it while a read is blocked.
#[derive(Clone)]
pub struct IdleTimer {
    state: Arc<Mutex<TimerState>>,
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTimer {
    /// A disabled timer.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Arm the timer for `dur` of inactivity, or disable it with
    /// `Duration::ZERO`. Either way a pending expiry is cleared and any
    /// blocked read or write is woken to observe the new setting.
    pub fn set_idle_timeout(&self, dur: Duration) {
        let (read_waker, write_waker) = {
            let mut st = self.state.lock();
            st.expired = false;
            st.timeout = dur;
            st.deadline = if dur.is_zero() {
                None
            } else {
                Some(Instant::now() + dur)
            };
            (st.read_waker.take(), st.write_waker.take())
        };
        if let Some(w) = read_waker {
            w.wake();
        }
        if let Some(w) = write_waker {
            w.wake();
        }
    }

    /// Currently configured duration (zero when disabled).
    pub fn idle_timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    /// A successful byte transfer in either direction pushes the deadline
    /// out to `now + timeout`.
    fn touch(&self) {
        let mut st = self.state.lock();
        if !st.timeout.is_zero() {
            st.deadline = Some(Instant::now() + st.timeout);
        }
    }

    /// Entry check run before touching the underlying stream: a deadline
    /// already in the past (or a prior unacknowledged expiry) fails the
    /// operation immediately.
    fn expire_now(&self) -> bool {
        let other = {
            let mut st = self.state.lock();
            if st.expired {
                return true;
            }
            match st.deadline {
                Some(d) if d <= Instant::now() => {
                    st.expired = true;
                    st.read_waker
                        .take()
                        .into_iter()
                        .chain(st.write_waker.take())
                        .collect::<Vec<_>>()
                }
                _ => return false,
            }
        };
        for w in other {
            w.wake();
        }
        true
    }

    /// Wait for the deadline while an I/O poll is pending. Resolves only on
    /// expiry; a disabled timer parks until re-armed. The per-direction
    /// `sleep` is re-targeted whenever the shared deadline moves (the
    /// auto-extension path never wakes us; the stale sleep fires, we observe
    /// the extended deadline, and go back to sleep).
    fn poll_idle(
        &self,
        cx: &mut Context<'_>,
        dir: Dir,
        sleep: &mut Pin<Box<Sleep>>,
    ) -> Poll<()> {
        loop {
            let deadline = {
                let mut st = self.state.lock();
                if st.expired {
                    return Poll::Ready(());
                }
                match st.deadline {
                    None => {
                        st.store_waker(dir, cx.waker());
                        return Poll::Pending;
                    }
                    Some(d) if d <= Instant::now() => {
                        st.expired = true;
                        let other = st.take_waker(dir.other());
                        drop(st);
                        if let Some(w) = other {
                            w.wake();
                        }
                        return Poll::Ready(());
                    }
                    Some(d) => {
                        st.store_waker(dir, cx.waker());
                        d
                    }
                }
            };

            if sleep.deadline() != deadline {
                sleep.as_mut().reset(deadline);
            }
            match sleep.as_mut().poll(cx) {
                // the deadline may have been extended while we slept
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Stream wrapper applying an [`IdleTimer`] to reads and writes.
///
/// One reader and one writer may run concurrently (split the stream with
/// `tokio::io::split`); both directions share the single timer.
pub struct IdleStream<S> {
    inner: S,
    timer: IdleTimer,
    read_sleep: Pin<Box<Sleep>>,
    write_sleep: Pin<Box<Sleep>>,
}

impl<S> IdleStream<S> {
    /// Wrap with a disabled timer.
    pub fn new(inner: S) -> Self {
        Self::with_timer(inner, IdleTimer::new())
    }

    /// Wrap and arm the timer in one step; `Duration::ZERO` leaves it
    /// disabled.
    pub fn with_timeout(inner: S, dur: Duration) -> Self {
        let timer = IdleTimer::new();
        if !dur.is_zero() {
            timer.set_idle_timeout(dur);
        }
        Self::with_timer(inner, timer)
    }

    pub fn with_timer(inner: S, timer: IdleTimer) -> Self {
        Self {
            inner,
            timer,
            read_sleep: Box::pin(sleep_until(Instant::now())),
            write_sleep: Box::pin(sleep_until(Instant::now())),
        }
    }

    /// Handle for re-arming the timer from any task.
    pub fn timer(&self) -> IdleTimer {
        self.timer.clone()
    }

    pub fn set_idle_timeout(&self, dur: Duration) {
        self.timer.set_idle_timeout(dur);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.timer.expire_now() {
            return Poll::Ready(Err(idle_expired()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.timer.touch();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.timer.poll_idle(cx, Dir::Read, &mut this.read_sleep) {
                Poll::Ready(()) => Poll::Ready(Err(idle_expired())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.timer.expire_now() {
            return Poll::Ready(Err(idle_expired()));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.timer.touch();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.timer.poll_idle(cx, Dir::Write, &mut this.write_sleep) {
                Poll::Ready(()) => Poll::Ready(Err(idle_expired())),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
