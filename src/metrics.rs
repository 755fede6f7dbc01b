//! Control Plane Metrics
//!
//! Prometheus counters for orchestration outcomes. Each instance owns its own
//! registry so several control planes (and tests) can coexist in a process.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const OPERATION_LABEL: &str = "operation";

/// Counters for dispatches, no-ops, rejections, device failures and rollbacks
#[derive(Clone)]
pub struct ControlPlaneMetrics {
    registry: Registry,
    dispatches: IntCounterVec,
    no_ops: IntCounterVec,
    rejections: IntCounterVec,
    device_failures: IntCounterVec,
    tasks_created: IntCounter,
    rollbacks: IntCounter,
}

impl ControlPlaneMetrics {
    /// Create metrics registered into a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dispatches = IntCounterVec::new(
            Opts::new(
                "replica_control_plane_dispatches_total",
                "Gateway dispatches issued",
            ),
            &[OPERATION_LABEL],
        )?;
        let no_ops = IntCounterVec::new(
            Opts::new(
                "replica_control_plane_no_ops_total",
                "Requests resolved without a gateway call",
            ),
            &[OPERATION_LABEL],
        )?;
        let rejections = IntCounterVec::new(
            Opts::new(
                "replica_control_plane_rejections_total",
                "Requests rejected by validation",
            ),
            &[OPERATION_LABEL],
        )?;
        let device_failures = IntCounterVec::new(
            Opts::new(
                "replica_control_plane_device_failures_total",
                "Gateway dispatches that failed",
            ),
            &[OPERATION_LABEL],
        )?;
        let tasks_created = IntCounter::new(
            "replica_control_plane_tasks_created_total",
            "Task records created",
        )?;
        let rollbacks = IntCounter::new(
            "replica_control_plane_rollbacks_total",
            "Speculative entities rolled back",
        )?;

        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(no_ops.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(device_failures.clone()))?;
        registry.register(Box::new(tasks_created.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;

        Ok(Self {
            registry,
            dispatches,
            no_ops,
            rejections,
            device_failures,
            tasks_created,
            rollbacks,
        })
    }

    #[inline]
    pub fn record_dispatch(&self, operation: &str) {
        self.dispatches.with_label_values(&[operation]).inc();
    }

    #[inline]
    pub fn record_no_op(&self, operation: &str) {
        self.no_ops.with_label_values(&[operation]).inc();
    }

    #[inline]
    pub fn record_rejection(&self, operation: &str) {
        self.rejections.with_label_values(&[operation]).inc();
    }

    #[inline]
    pub fn record_device_failure(&self, operation: &str) {
        self.device_failures.with_label_values(&[operation]).inc();
    }

    #[inline]
    pub fn record_task_created(&self) {
        self.tasks_created.inc();
    }

    #[inline]
    pub fn record_rollbacks(&self, count: u64) {
        self.rollbacks.inc_by(count);
    }

    pub fn dispatch_count(&self, operation: &str) -> u64 {
        self.dispatches.with_label_values(&[operation]).get()
    }

    pub fn device_failure_count(&self, operation: &str) -> u64 {
        self.device_failures.with_label_values(&[operation]).get()
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
