//! Panic recovery.
//!
//! A panic anywhere below [`Recovery`] in the chain is caught, reported
//! through a panic handler (a structured `tracing` error by default) and
//! answered with `500 Internal Server Error`. The connection task survives
//! and the server keeps accepting.
//!
//! The stack trace of the panicking thread is captured by a process-wide
//! panic hook, installed the first time a `Recovery` is built. Outside a
//! recovery scope the hook defers to whatever hook was installed before, so
//! panics elsewhere in the process are reported exactly as they were.
//! Inside the scope the previous hook is not called, so a panic that a
//! handler catches itself (with its own `catch_unwind`) is not printed.
//!
//! Stack traces stay out of the response body unless
//! [`print_stack`](Recovery::print_stack) is enabled.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use http::StatusCode;

use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Default cap on the captured stack trace, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 50 * 1024;

/// A recovered panic, as handed to the panic handler.
#[derive(Clone, Debug)]
pub struct Panic {
    /// The panic payload rendered as text.
    pub message: String,
    /// Backtrace of the panicking thread, truncated to the configured size.
    pub stack: String,
}

type PanicHandler = Arc<dyn Fn(&Panic) + Send + Sync>;

#[derive(Clone)]
pub struct Recovery {
    handler: PanicHandler,
    stack_size: usize,
    print_stack: bool,
}

impl Recovery {
    /// Logs panics through `tracing`, keeps up to 50 KiB of stack, and
    /// leaves the response body empty.
    pub fn new() -> Self {
        install_hook();
        Self {
            handler: Arc::new(log_panic),
            stack_size: DEFAULT_STACK_SIZE,
            print_stack: false,
        }
    }

    /// Replaces the panic handler, e.g. to forward panics to an error
    /// tracker. A panic inside the handler degrades the reply to a bare 500.
    pub fn panic_handler(mut self, handler: impl Fn(&Panic) + Send + Sync + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Writes `PANIC!: <message>\n<stack>\n` into the response body.
    /// Development only: it leaks internals to clients.
    pub fn print_stack(mut self, enabled: bool) -> Self {
        self.print_stack = enabled;
        self
    }

    fn respond(&self, payload: &(dyn Any + Send)) -> Response {
        let mut stack = LAST_TRACE.with(|t| t.borrow_mut().take()).unwrap_or_default();
        truncate_on_char_boundary(&mut stack, self.stack_size);
        let panic = Panic { message: panic_message(payload), stack };

        let reported = {
            let _scope = Scope::enter();
            panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(&panic)))
        };
        clear_trace();
        if let Err(secondary) = reported {
            tracing::error!(panic = %panic_message(secondary.as_ref()), "error in panic handler");
            return Response::status(StatusCode::INTERNAL_SERVER_ERROR);
        }

        if self.print_stack {
            let body = format!("PANIC!: {}\n{}", panic.message, panic.stack);
            return Response::error(StatusCode::INTERNAL_SERVER_ERROR, &body);
        }
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .text("")
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Recovery {
    fn call(&self, req: Request, next: Next) -> BoxFuture {
        let this = self.clone();
        Box::pin(async move {
            let guarded = Scoped { inner: next.run(req) };
            match AssertUnwindSafe(guarded).catch_unwind().await {
                Ok(res) => {
                    // Left behind by a panic the handler recovered from.
                    clear_trace();
                    res
                }
                Err(payload) => this.respond(payload.as_ref()),
            }
        })
    }
}

fn log_panic(panic: &Panic) {
    tracing::error!(panic = %panic.message, stacktrace = %panic.stack, "PANIC! in http handler");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ── Stack capture ─────────────────────────────────────────────────────────────

thread_local! {
    static SCOPE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if SCOPE_DEPTH.with(Cell::get) > 0 {
                let trace = Backtrace::force_capture().to_string();
                let trace = skip_panic_machinery(&trace).to_owned();
                LAST_TRACE.with(|t| *t.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn clear_trace() {
    LAST_TRACE.with(|t| t.borrow_mut().take());
}

/// Frames of the hook itself and of std's panic entry points.
const PANIC_MACHINERY: [&str; 4] = [
    "std::panicking::",
    "core::panicking::",
    "rust_begin_unwind",
    "__rust_end_short_backtrace",
];

/// Drops the frames above the first one outside the panic machinery, so the
/// trace starts at the code that panicked. Traces without symbols are kept
/// whole.
fn skip_panic_machinery(trace: &str) -> &str {
    let mut in_machinery = false;
    let mut offset = 0;
    for line in trace.split_inclusive('\n') {
        if is_frame_header(line) {
            let machinery = PANIC_MACHINERY.iter().any(|m| line.contains(m));
            if in_machinery && !machinery {
                return &trace[offset..];
            }
            in_machinery |= machinery;
        }
        offset += line.len();
    }
    trace
}

/// `  12: some::symbol`, as opposed to the `at file:line` lines under it.
fn is_frame_header(line: &str) -> bool {
    line.trim_start()
        .split_once(':')
        .is_some_and(|(n, _)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Marks the current thread as inside a recovery scope for its lifetime.
struct Scope;

impl Scope {
    fn enter() -> Self {
        SCOPE_DEPTH.with(|d| d.set(d.get() + 1));
        Scope
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        SCOPE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Enters a [`Scope`] around every poll of the inner future, so the hook
/// knows a panic on this thread will be recovered.
struct Scoped {
    inner: BoxFuture,
}

impl Future for Scoped {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        let _scope = Scope::enter();
        self.inner.as_mut().poll(cx)
    }
}
