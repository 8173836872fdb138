//! Lightweight operation-counting hooks for the volume engine.

use std::sync::{Arc, OnceLock};

/// `IoOpType` describes a read or write operation.
#[derive(Copy, Clone, Debug)]
pub enum IoOpType {
    Read,
    Write,
}

/// `GfOpKind` identifies a GF kernel operation class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GfOpKind {
    Xor,
    Mul,
    MulAdd,
}

/// `DiskOp` captures a block-level disk access.
#[derive(Copy, Clone, Debug)]
pub struct DiskOp {
    pub disk_id: u32,
    pub op: IoOpType,
    pub blocks: u64,
}

/// `GfOp` captures one GF kernel call over a byte buffer.
#[derive(Copy, Clone, Debug)]
pub struct GfOp {
    pub op: GfOpKind,
    pub bytes: usize,
}

/// `MetricsSink` records disk and codec operations emitted by the engine.
pub trait MetricsSink: Send + Sync + 'static {
    /// `record_disk_op` records a block-level disk access.
    fn record_disk_op(&self, op: DiskOp);
    /// `record_gf_op` records a GF kernel operation.
    fn record_gf_op(&self, op: GfOp);
}

static METRICS_SINK: OnceLock<Arc<dyn MetricsSink>> = OnceLock::new();

/// `install_metrics_sink` installs a global metrics sink.
///
/// # Returns
/// `true` if the sink was installed, `false` if one was already registered.
pub fn install_metrics_sink(sink: Arc<dyn MetricsSink>) -> bool {
    METRICS_SINK.set(sink).is_ok()
}

/// `is_enabled` reports whether a metrics sink has been installed.
pub fn is_enabled() -> bool {
    METRICS_SINK.get().is_some()
}

/// `record_disk_op` forwards a disk operation to the installed sink.
pub fn record_disk_op(disk_id: u32, op: IoOpType, blocks: u64) {
    if let Some(sink) = METRICS_SINK.get() {
        sink.record_disk_op(DiskOp {
            disk_id,
            op,
            blocks,
        });
    }
}

/// `record_gf_op` forwards a GF kernel operation to the installed sink.
pub fn record_gf_op(op: GfOpKind, bytes: usize) {
    if let Some(sink) = METRICS_SINK.get() {
        sink.record_gf_op(GfOp { op, bytes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestSink {
        disk_ops: Mutex<Vec<DiskOp>>,
        gf_ops: Mutex<Vec<GfOp>>,
    }

    impl MetricsSink for TestSink {
        fn record_disk_op(&self, op: DiskOp) {
            self.disk_ops.lock().unwrap().push(op);
        }

        fn record_gf_op(&self, op: GfOp) {
            self.gf_ops.lock().unwrap().push(op);
        }
    }

    #[test]
    fn metrics_sink_records_ops_when_enabled() {
        let sink = Arc::new(TestSink {
            disk_ops: Mutex::new(Vec::new()),
            gf_ops: Mutex::new(Vec::new()),
        });

        assert!(install_metrics_sink(sink.clone()));
        assert!(is_enabled());

        record_disk_op(3, IoOpType::Write, 8);
        record_gf_op(GfOpKind::MulAdd, 64);

        {
            let disk_ops = sink.disk_ops.lock().unwrap();
            assert_eq!(disk_ops.len(), 1);
            assert_eq!(disk_ops[0].disk_id, 3);
            assert_eq!(disk_ops[0].blocks, 8);
        }

        {
            let gf_ops = sink.gf_ops.lock().unwrap();
            assert_eq!(gf_ops.len(), 1);
            assert_eq!(gf_ops[0].bytes, 64);
            assert_eq!(gf_ops[0].op, GfOpKind::MulAdd);
        }
    }
}
