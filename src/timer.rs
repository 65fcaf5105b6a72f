//! Kick timer used to force the `vCPU` out of guest execution

use anyhow::{anyhow, Result};

use nix::errno::Errno;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of times the kick timer has fired
static KICKS: AtomicU64 = AtomicU64::new(0);

/// Handles the `SIGALRM` signal. Delivery alone interrupts a blocked `KVM_RUN` with
/// `EINTR`.
extern "C" fn handler_alarm(_val: libc::c_int) {
    KICKS.fetch_add(1, Ordering::Relaxed);
}

/// Number of times the kick timer has fired in this process
#[must_use]
pub fn kicks() -> u64 {
    KICKS.load(Ordering::Relaxed)
}

/// Periodic `ITIMER_REAL` timer. Disarmed on drop.
#[derive(Debug)]
pub struct KickTimer {
    /// Period of the timer
    interval: Duration,
}

impl KickTimer {
    /// Install the `SIGALRM` handler and arm a timer firing every `interval`
    ///
    /// # Errors
    ///
    /// * Installing the signal handler or unblocking `SIGALRM` failed
    /// * `setitimer` failed
    pub fn start(interval: Duration) -> Result<Self> {
        // Restart interrupted syscalls other than `KVM_RUN`, which always returns `EINTR`
        unsafe {
            sigaction(
                Signal::SIGALRM,
                &SigAction::new(
                    SigHandler::Handler(handler_alarm),
                    SaFlags::SA_RESTART,
                    SigSet::empty(),
                ),
            )?
        };

        let mut unblocked = SigSet::empty();
        unblocked.add(Signal::SIGALRM);
        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&unblocked), None)?;

        set_timer(interval)?;
        log::debug!("Kick timer armed every {interval:?}");

        Ok(Self { interval })
    }

    /// Period of the timer
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for KickTimer {
    fn drop(&mut self) {
        if let Err(err) = set_timer(Duration::ZERO) {
            log::warn!("Failed to disarm the kick timer: {err}");
        }
    }
}

/// Arm (or with a zero `interval`, disarm) the real time interval timer
fn set_timer(interval: Duration) -> Result<()> {
    let interval = libc::timeval {
        tv_sec: libc::time_t::try_from(interval.as_secs())?,
        tv_usec: libc::suseconds_t::from(interval.subsec_micros()),
    };

    let timer_val = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };

    let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer_val, std::ptr::null_mut()) };

    if ret == 0 {
        Ok(())
    } else {
        Err(anyhow!(Errno::last()))
    }
}
