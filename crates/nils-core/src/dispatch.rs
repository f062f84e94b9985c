// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parallel tool dispatcher.
//!
//! Given N tool calls, produces exactly N results in call order.  Each
//! call runs on its own task; a per-worker [`SlotGuard`] fills the
//! worker's result slot and bumps the tracker's completed counter from
//! its `Drop`, so a worker that finishes, panics, or is cancelled at any
//! await point still accounts for exactly one completion.  The waiter
//! unblocks only when `completed == total`, which makes "every tool call
//! gets a matching result" structural rather than best-effort.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::warn;

use nils_tools::{ToolCall, ToolRegistry};

/// One slot of the dispatcher's output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub output: Value,
    pub is_error: bool,
}

impl ToolCallResult {
    fn interrupted(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            output: json!({ "error": "interrupted" }),
            is_error: true,
        }
    }
}

struct Tracker {
    total: usize,
    completed: AtomicUsize,
    notify: Notify,
    slots: Mutex<Vec<Option<ToolCallResult>>>,
}

/// Owned by exactly one worker.  `Drop` is the sole place the tracker is
/// notified, so each worker notifies exactly once no matter how it exits.
struct SlotGuard {
    tracker: Arc<Tracker>,
    index: usize,
    call_id: String,
    tool_name: String,
    filled: bool,
}

impl SlotGuard {
    fn complete(&mut self, result: ToolCallResult) {
        self.tracker.slots.lock().expect("slot lock")[self.index] = Some(result);
        self.filled = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.filled {
            // Cancelled (or never ran): the slot still gets a result so
            // the tool-call closure invariant holds.
            self.tracker.slots.lock().expect("slot lock")[self.index] =
                Some(ToolCallResult::interrupted(&self.call_id, &self.tool_name));
        }
        self.tracker.completed.fetch_add(1, Ordering::SeqCst);
        self.tracker.notify.notify_waiters();
    }
}

const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// Run a batch of tool calls in parallel and collect results in call order.
///
/// When the interrupt flag is observed while workers are running, the
/// remaining workers are cancelled; their guards fill the open slots with
/// synthetic `interrupted` errors.  All workers are joined before this
/// returns.
pub async fn dispatch(
    calls: &[ToolCall],
    registry: &Arc<ToolRegistry>,
    interrupt: &Arc<AtomicBool>,
) -> Vec<ToolCallResult> {
    let total = calls.len();
    if total == 0 {
        return Vec::new();
    }

    let tracker = Arc::new(Tracker {
        total,
        completed: AtomicUsize::new(0),
        notify: Notify::new(),
        slots: Mutex::new(vec![None; total]),
    });

    let mut handles = Vec::with_capacity(total);
    for (index, call) in calls.iter().cloned().enumerate() {
        // The guard is created before the worker is spawned: if anything
        // goes wrong between here and the worker running, dropping the
        // guard (with the future) still fills the slot and counts.
        let mut guard = SlotGuard {
            tracker: Arc::clone(&tracker),
            index,
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            filled: false,
        };
        let registry = Arc::clone(registry);
        let interrupt = Arc::clone(interrupt);
        handles.push(tokio::spawn(async move {
            if interrupt.load(Ordering::SeqCst) {
                return; // guard drop records the interruption
            }
            match std::panic::AssertUnwindSafe(registry.execute(&call))
                .catch_unwind()
                .await
            {
                Ok(output) => guard.complete(ToolCallResult {
                    id: call.id,
                    name: call.name,
                    output: output.output,
                    is_error: output.is_error,
                }),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(tool = %call.name, %message, "tool panicked");
                    guard.complete(ToolCallResult {
                        id: call.id,
                        name: call.name,
                        output: json!({ "error": format!("tool panicked: {message}") }),
                        is_error: true,
                    });
                }
            }
        }));
    }

    // Wait for all workers, cancelling the stragglers once an interrupt
    // is observed.  Cancellation drops each worker future at its next
    // await point, which runs its guard.
    let mut cancelled = false;
    loop {
        let notified = tracker.notify.notified();
        if tracker.completed.load(Ordering::SeqCst) == total {
            break;
        }
        if !cancelled && interrupt.load(Ordering::SeqCst) {
            cancelled = true;
            for h in &handles {
                h.abort();
            }
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(INTERRUPT_POLL) => {}
        }
    }
    for h in handles {
        let _ = h.await;
    }

    let mut slots = tracker.slots.lock().expect("slot lock");
    slots
        .iter_mut()
        .map(|s| s.take().expect("every worker fills its slot"))
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nils_tools::{Tool, ToolOutput};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes args"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.clone())
        }
    }

    /// Sleeps for `ms` (from args), then echoes.
    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }
        fn description(&self) -> &str {
            "sleeps then echoes"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            let ms = call.args["ms"].as_u64().unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ToolOutput::ok(&call.id, json!({ "slept_ms": ms }))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _call: &ToolCall) -> ToolOutput {
            panic!("deliberate test panic");
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(SleepTool);
        reg.register(PanicTool);
        Arc::new(reg)
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    fn no_interrupt() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        assert!(dispatch(&[], &registry(), &no_interrupt()).await.is_empty());
    }

    #[tokio::test]
    async fn results_preserve_call_order_not_completion_order() {
        let calls = vec![
            call("c1", "sleep", json!({"ms": 50})),
            call("c2", "echo", json!({"fast": true})),
        ];
        let results = dispatch(&calls, &registry(), &no_interrupt()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "c1");
        assert_eq!(results[0].output["slept_ms"], 50);
        assert_eq!(results[1].id, "c2");
        assert_eq!(results[1].output["fast"], true);
    }

    #[tokio::test]
    async fn every_call_gets_exactly_one_result() {
        let calls: Vec<ToolCall> = (0..16)
            .map(|i| call(&format!("c{i}"), "echo", json!({"i": i})))
            .collect();
        let results = dispatch(&calls, &registry(), &no_interrupt()).await;
        assert_eq!(results.len(), 16);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.id, format!("c{i}"));
            assert_eq!(r.output["i"], i);
        }
    }

    #[tokio::test]
    async fn unknown_tool_fills_its_slot_with_an_error() {
        let calls = vec![
            call("c1", "echo", json!({})),
            call("c2", "no_such_tool", json!({})),
        ];
        let results = dispatch(&calls, &registry(), &no_interrupt()).await;
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert_eq!(results[1].output["error"], "unknown tool: no_such_tool");
    }

    #[tokio::test]
    async fn panicking_tool_fills_its_slot_and_others_survive() {
        let calls = vec![
            call("c1", "panic", json!({})),
            call("c2", "echo", json!({"ok": 1})),
        ];
        let results = dispatch(&calls, &registry(), &no_interrupt()).await;
        assert!(results[0].is_error);
        assert!(results[0].output["error"]
            .as_str()
            .unwrap()
            .contains("deliberate test panic"));
        assert!(!results[1].is_error);
    }

    #[tokio::test]
    async fn interrupt_mid_batch_fills_all_slots() {
        let interrupt = no_interrupt();
        let calls = vec![
            call("c1", "sleep", json!({"ms": 5000})),
            call("c2", "echo", json!({})),
        ];
        let flag = Arc::clone(&interrupt);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let started = std::time::Instant::now();
        let results = dispatch(&calls, &registry(), &interrupt).await;
        // The 5s sleeper was cancelled, not waited for.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].output["error"], "interrupted");
        assert!(results[0].is_error);
    }

    #[tokio::test]
    async fn preset_interrupt_synthesizes_all_results() {
        let interrupt = Arc::new(AtomicBool::new(true));
        let calls = vec![
            call("c1", "echo", json!({})),
            call("c2", "echo", json!({})),
        ];
        let results = dispatch(&calls, &registry(), &interrupt).await;
        assert_eq!(results.len(), 2);
        for r in &results {
            assert!(r.is_error);
            assert_eq!(r.output["error"], "interrupted");
        }
    }

    #[tokio::test]
    async fn large_interrupted_batch_never_loses_a_slot() {
        // Race cancellation against a mix of fast and slow workers many
        // times; the completed count must always equal the batch size.
        for _ in 0..20 {
            let interrupt = no_interrupt();
            let calls: Vec<ToolCall> = (0..8)
                .map(|i| {
                    if i % 2 == 0 {
                        call(&format!("c{i}"), "echo", json!({}))
                    } else {
                        call(&format!("c{i}"), "sleep", json!({"ms": 30}))
                    }
                })
                .collect();
            let flag = Arc::clone(&interrupt);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                flag.store(true, Ordering::SeqCst);
            });
            let results = dispatch(&calls, &registry(), &interrupt).await;
            assert_eq!(results.len(), 8);
            for (i, r) in results.iter().enumerate() {
                assert_eq!(r.id, format!("c{i}"), "slot order must match call order");
            }
        }
    }
}
