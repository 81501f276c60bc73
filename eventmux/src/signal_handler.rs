// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide signal handler.
//!
//! Unlike everything else in this crate, signal disposition is genuinely
//! process-global, so this is a true singleton installed once, before any
//! reactor runs. Two masks drive it: "terminal" signals are caught and
//! terminate the process (optionally after a stack dump), "ignored"
//! signals are suppressed. Per-signal user callbacks can veto the default
//! terminal behavior; a separate mask selects which signals dump a stack
//! before the log line.

use crate::error::{Error, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::{Mutex, OnceLock};

/// One bit per signal number.
pub type SignalMask = u64;

pub const SIGNAL_HANGUP: SignalMask = 1 << libc::SIGHUP;
pub const SIGNAL_INTERRUPT: SignalMask = 1 << libc::SIGINT;
pub const SIGNAL_QUIT: SignalMask = 1 << libc::SIGQUIT;
pub const SIGNAL_ILLEGAL: SignalMask = 1 << libc::SIGILL;
pub const SIGNAL_TRAP: SignalMask = 1 << libc::SIGTRAP;
pub const SIGNAL_ABORT: SignalMask = 1 << libc::SIGABRT;
pub const SIGNAL_BUS: SignalMask = 1 << libc::SIGBUS;
pub const SIGNAL_FPE: SignalMask = 1 << libc::SIGFPE;
pub const SIGNAL_USR1: SignalMask = 1 << libc::SIGUSR1;
pub const SIGNAL_SEGV: SignalMask = 1 << libc::SIGSEGV;
pub const SIGNAL_USR2: SignalMask = 1 << libc::SIGUSR2;
pub const SIGNAL_PIPE: SignalMask = 1 << libc::SIGPIPE;
pub const SIGNAL_ALARM: SignalMask = 1 << libc::SIGALRM;
pub const SIGNAL_TERMINATE: SignalMask = 1 << libc::SIGTERM;
pub const SIGNAL_CHILD: SignalMask = 1 << libc::SIGCHLD;
pub const SIGNAL_CONTINUE: SignalMask = 1 << libc::SIGCONT;
pub const SIGNAL_INTERACTIVE_STOP: SignalMask = 1 << libc::SIGTSTP;
pub const SIGNAL_TERMINAL_IN: SignalMask = 1 << libc::SIGTTIN;
pub const SIGNAL_TERMINAL_OUT: SignalMask = 1 << libc::SIGTTOU;
pub const SIGNAL_URGENT: SignalMask = 1 << libc::SIGURG;
pub const SIGNAL_XCPU: SignalMask = 1 << libc::SIGXCPU;
pub const SIGNAL_FILE_SIZE: SignalMask = 1 << libc::SIGXFSZ;
pub const SIGNAL_VIRTUAL_ALARM: SignalMask = 1 << libc::SIGVTALRM;
pub const SIGNAL_PROFILING: SignalMask = 1 << libc::SIGPROF;
pub const SIGNAL_WINDOW_CHANGE: SignalMask = 1 << libc::SIGWINCH;
pub const SIGNAL_POLL: SignalMask = 1 << libc::SIGPOLL;
pub const SIGNAL_POWER: SignalMask = 1 << libc::SIGPWR;
pub const SIGNAL_SYSTEM: SignalMask = 1 << libc::SIGSYS;

/// Every signal except number 0.
pub const ALL_SIGNALS: SignalMask = 0xFFFF_FFFF_FFFF_FFFE;

/// Crash-style signals caught by default.
pub const DEFAULT_SIGNAL_TERMINAL: SignalMask =
    SIGNAL_ILLEGAL | SIGNAL_BUS | SIGNAL_FPE | SIGNAL_SEGV;

/// Terminal mask extended with user interruptions.
pub const EXTENDED_SIGNAL_TERMINAL: SignalMask =
    DEFAULT_SIGNAL_TERMINAL | SIGNAL_INTERRUPT | SIGNAL_QUIT | SIGNAL_TERMINATE;

/// Signals ignored by default.
pub const DEFAULT_SIGNAL_IGNORE: SignalMask =
    SIGNAL_INTERACTIVE_STOP | SIGNAL_TERMINAL_IN | SIGNAL_TERMINAL_OUT | SIGNAL_PIPE;

/// Signals that produce a stack dump by default (the routine ones do
/// not).
pub const DEFAULT_SHOW_STACK: SignalMask = ALL_SIGNALS
    & !(SIGNAL_ALARM
        | SIGNAL_CHILD
        | SIGNAL_HANGUP
        | SIGNAL_INTERRUPT
        | SIGNAL_PIPE
        | SIGNAL_QUIT
        | SIGNAL_TERMINATE
        | SIGNAL_USR1
        | SIGNAL_USR2
        | SIGNAL_VIRTUAL_ALARM
        | SIGNAL_WINDOW_CHANGE);

/// Return value of a callback: whether the signal was fully handled (a
/// handled terminal signal does not terminate the process).
pub type SignalHandlerCallback = Box<dyn Fn(u32, i32) -> bool + Send + Sync>;

struct CallbackEntry {
    id: u32,
    signal_number: i32,
    callback: SignalHandlerCallback,
}

#[derive(Default)]
struct HandlerState {
    terminal: SignalMask,
    ignored: SignalMask,
    show_stack: SignalMask,
    callbacks: Vec<CallbackEntry>,
}

pub struct SignalHandler {
    state: Mutex<HandlerState>,
}

static INSTANCE: OnceLock<SignalHandler> = OnceLock::new();

extern "C" fn signal_handler_func(signal_number: libc::c_int) {
    if let Some(handler) = INSTANCE.get() {
        handler.process_signal(signal_number);
    }
}

impl SignalHandler {
    /// Install the singleton with the given terminal and ignored masks.
    /// Fails when called twice.
    pub fn create_instance(terminal: SignalMask, ignored: SignalMask) -> Result<&'static Self> {
        let mut fresh = false;
        let handler = INSTANCE.get_or_init(|| {
            fresh = true;
            SignalHandler {
                state: Mutex::new(HandlerState {
                    show_stack: DEFAULT_SHOW_STACK,
                    ..HandlerState::default()
                }),
            }
        });
        if !fresh {
            return Err(Error::InvalidParameter(
                "create_instance() must be called once, before get_instance()".to_string(),
            ));
        }
        handler.add_terminal_signals(terminal)?;
        handler.add_ignored_signals(ignored)?;
        Ok(handler)
    }

    /// The singleton; created with empty masks when
    /// [`SignalHandler::create_instance`] was never called.
    pub fn get_instance() -> &'static Self {
        INSTANCE.get_or_init(|| SignalHandler {
            state: Mutex::new(HandlerState {
                show_stack: DEFAULT_SHOW_STACK,
                ..HandlerState::default()
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HandlerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Runtime("signal handler mutex poisoned".to_string()))
    }

    /// Register a callback for one signal. `id` is caller-chosen and used
    /// for removal; several callbacks may share an id.
    ///
    /// Callbacks run in signal context with the handler lock held: they
    /// must not call back into this API.
    pub fn add_callback(&self, id: u32, signal_number: i32, callback: SignalHandlerCallback) -> Result<()> {
        if signal_number < 1 || signal_number >= 64 {
            return Err(Error::InvalidParameter(format!(
                "add_callback() called with invalid signal number {signal_number}"
            )));
        }
        self.lock()?.callbacks.push(CallbackEntry {
            id,
            signal_number,
            callback,
        });
        Ok(())
    }

    /// Remove all callbacks registered under `id`.
    pub fn remove_callback(&self, id: u32) -> Result<()> {
        self.lock()?.callbacks.retain(|entry| entry.id != id);
        Ok(())
    }

    /// Which signals dump a stack before the fatal log line.
    pub fn set_show_stack(&self, mask: SignalMask) -> Result<()> {
        self.lock()?.show_stack = mask;
        Ok(())
    }

    pub fn get_show_stack(&self) -> Result<SignalMask> {
        Ok(self.lock()?.show_stack)
    }

    /// Catch the signals in `mask` as terminal.
    pub fn add_terminal_signals(&self, mask: SignalMask) -> Result<()> {
        let previous = {
            let mut state = self.lock()?;
            let previous = state.terminal;
            state.terminal |= mask;
            state.ignored &= !mask;
            previous
        };
        for signal_number in mask_signals(mask & !previous) {
            let action = SigAction::new(
                SigHandler::Handler(signal_handler_func),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // Safety: installing our handler; the previous disposition is
            // intentionally discarded.
            unsafe { signal::sigaction(signal_number, &action) }.map_err(|e| {
                Error::Initialization(format!(
                    "sigaction({signal_number}) failed: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Ignore the signals in `mask`.
    pub fn add_ignored_signals(&self, mask: SignalMask) -> Result<()> {
        let previous = {
            let mut state = self.lock()?;
            let previous = state.ignored;
            state.ignored |= mask;
            state.terminal &= !mask;
            previous
        };
        for signal_number in mask_signals(mask & !previous) {
            let action = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
            // Safety: setting SIG_IGN; the previous disposition is
            // intentionally discarded.
            unsafe { signal::sigaction(signal_number, &action) }.map_err(|e| {
                Error::Initialization(format!(
                    "sigaction({signal_number}) failed: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Restore the default disposition for the signals in `mask`.
    pub fn remove_signals(&self, mask: SignalMask) -> Result<()> {
        let affected = {
            let mut state = self.lock()?;
            let affected = (state.terminal | state.ignored) & mask;
            state.terminal &= !mask;
            state.ignored &= !mask;
            affected
        };
        for signal_number in mask_signals(affected) {
            let action = SigAction::new(SigHandler::SigDfl, SaFlags::SA_RESTART, SigSet::empty());
            // Safety: restoring the default disposition.
            unsafe { signal::sigaction(signal_number, &action) }.map_err(|e| {
                Error::Initialization(format!(
                    "sigaction({signal_number}) failed: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Restore the default disposition for every managed signal.
    pub fn remove_all_signals(&self) -> Result<()> {
        self.remove_signals(ALL_SIGNALS)
    }

    fn process_signal(&self, signal_number: libc::c_int) {
        let Ok(state) = self.state.lock() else {
            return;
        };

        let mut handled = false;
        for entry in &state.callbacks {
            if entry.signal_number == signal_number && (entry.callback)(entry.id, signal_number) {
                handled = true;
            }
        }
        if handled {
            return;
        }

        let bit = 1u64.checked_shl(signal_number as u32).unwrap_or(0);
        if state.terminal & bit == 0 {
            return;
        }

        if state.show_stack & bit != 0 {
            let backtrace = backtrace::Backtrace::new();
            tracing::error!("signal stack trace:\n{backtrace:?}");
        }
        tracing::error!(
            "fatal signal received: {}",
            signal_name(signal_number)
        );
        drop(state);

        // restore the default disposition and re-raise so the process
        // terminates with the original signal semantics
        if let Ok(signal) = Signal::try_from(signal_number) {
            let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // Safety: restoring the default disposition before re-raise.
            let _ = unsafe { signal::sigaction(signal, &action) };
            let _ = signal::raise(signal);
        }
        std::process::exit(128 + signal_number);
    }
}

/// The signals selected by a mask, as `nix` signal values.
fn mask_signals(mask: SignalMask) -> Vec<Signal> {
    let mut signals = Vec::new();
    for signal_number in 1..64 {
        if mask & (1u64 << signal_number) != 0 {
            if let Ok(signal) = Signal::try_from(signal_number) {
                signals.push(signal);
            }
        }
    }
    signals
}

/// Human readable name of a signal number.
pub fn signal_name(signal_number: i32) -> &'static str {
    match Signal::try_from(signal_number) {
        Ok(signal) => signal.as_str(),
        Err(_) => "UNKNOWN",
    }
}
