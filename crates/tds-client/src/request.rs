//! The single in-flight request.

use std::sync::Arc;

use bytes::Bytes;
use tds_wire::batch::encode_sql_batch;
use tds_wire::packet::PacketType;
use tds_wire::rpc::{ParamValue, ProcId, RpcParam, RpcRequest};
use tds_wire::tman::{self, TmIsolationLevel};
use tds_wire::token::{ColumnMetadata, ReturnValue, Row};

use crate::error::RequestError;

/// Completion callback: `(error, row_count, rows)`.
///
/// `rows` is populated only when a row-collection option is enabled.
pub type CompletionSink = Box<dyn FnOnce(Option<RequestError>, u64, Vec<Row>) + Send>;

/// Completion callback for transaction-manager requests:
/// `(error, current_descriptor)`.
pub type TransactionSink = Box<dyn FnOnce(Option<RequestError>, u64) + Send>;

/// Completion callback for `prepare`: `(error, handle)`.
pub type PrepareSink = Box<dyn FnOnce(Option<RequestError>, Option<i32>) + Send>;

pub(crate) enum Sink {
    Completion(CompletionSink),
    Transaction(TransactionSink),
    Prepare(PrepareSink),
}

pub(crate) enum RequestPayload {
    SqlBatch(String),
    Rpc(RpcRequest),
    Transaction(TmOp),
}

pub(crate) enum TmOp {
    Begin {
        isolation: TmIsolationLevel,
        name: String,
    },
    Commit {
        name: String,
    },
    Rollback {
        name: String,
    },
}

/// A pending user operation: a SQL batch, an RPC, or a transaction
/// manager command. At most one request lives on a connection at a time.
pub struct Request {
    pub(crate) payload: RequestPayload,
    pub(crate) sink: Option<Sink>,
    /// First server error observed for this request.
    pub(crate) error: Option<RequestError>,
    /// Running sum of `done` row counts.
    pub(crate) row_count: u64,
    /// Collected rows, when a row-collection option is enabled.
    pub(crate) rows: Vec<Row>,
    /// Output parameter values.
    pub(crate) return_values: Vec<ReturnValue>,
    /// Result-set metadata, deduplicated when `use_column_names` is set.
    pub metadata: Option<Arc<ColumnMetadata>>,
    /// Column ordering reported by the server.
    pub order: Vec<u16>,
    /// Set when a `done` token carrying the attention bit is seen.
    pub(crate) canceled: bool,
}

impl Request {
    fn new(payload: RequestPayload, sink: Sink) -> Self {
        Self {
            payload,
            sink: Some(sink),
            error: None,
            row_count: 0,
            rows: Vec::new(),
            return_values: Vec::new(),
            metadata: None,
            order: Vec::new(),
            canceled: false,
        }
    }

    /// A raw SQL batch.
    pub fn sql_batch(
        sql: impl Into<String>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        Self::new(
            RequestPayload::SqlBatch(sql.into()),
            Sink::Completion(Box::new(sink)),
        )
    }

    /// An arbitrary RPC.
    pub fn rpc(
        rpc: RpcRequest,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        Self::new(RequestPayload::Rpc(rpc), Sink::Completion(Box::new(sink)))
    }

    /// Parameterized SQL via `sp_executesql`.
    pub fn exec_sql(
        sql: impl Into<String>,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        let sql = sql.into();
        let mut rpc_params = vec![
            RpcParam::input("@statement", ParamValue::NVarChar(sql)),
            RpcParam::input("@params", ParamValue::NVarChar(declarations(&params))),
        ];
        rpc_params.extend(params);
        Self::rpc(RpcRequest::by_id(ProcId::ExecuteSql, rpc_params), sink)
    }

    /// Prepare a statement via `sp_prepare`. The handle arrives through
    /// the sink.
    pub fn prepare(
        sql: impl Into<String>,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, Option<i32>) + Send + 'static,
    ) -> Self {
        let sql = sql.into();
        let rpc = RpcRequest::by_id(
            ProcId::Prepare,
            vec![
                RpcParam::out("@handle", ParamValue::Null),
                RpcParam::input("@params", ParamValue::NVarChar(declarations(&params))),
                RpcParam::input("@stmt", ParamValue::NVarChar(sql)),
                RpcParam::input("@options", ParamValue::Int(1)),
            ],
        );
        Self::new(RequestPayload::Rpc(rpc), Sink::Prepare(Box::new(sink)))
    }

    /// Execute a prepared handle via `sp_execute`.
    pub fn execute(
        handle: i32,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        let mut rpc_params = vec![RpcParam::input("@handle", ParamValue::Int(handle))];
        rpc_params.extend(params);
        Self::rpc(RpcRequest::by_id(ProcId::Execute, rpc_params), sink)
    }

    /// Release a prepared handle via `sp_unprepare`.
    pub fn unprepare(
        handle: i32,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        Self::rpc(
            RpcRequest::by_id(
                ProcId::Unprepare,
                vec![RpcParam::input("@handle", ParamValue::Int(handle))],
            ),
            sink,
        )
    }

    /// Call a stored procedure by name.
    pub fn call_procedure(
        name: impl Into<String>,
        params: Vec<RpcParam>,
        sink: impl FnOnce(Option<RequestError>, u64, Vec<Row>) + Send + 'static,
    ) -> Self {
        Self::rpc(RpcRequest::by_name(name, params), sink)
    }

    pub(crate) fn transaction_manager(op: TmOp, sink: TransactionSink) -> Self {
        Self::new(RequestPayload::Transaction(op), Sink::Transaction(sink))
    }

    /// Encode the outbound payload, attaching the current transaction
    /// descriptor.
    pub(crate) fn encode(&self, transaction_descriptor: u64) -> (PacketType, Bytes) {
        match &self.payload {
            RequestPayload::SqlBatch(sql) => (
                PacketType::SqlBatch,
                encode_sql_batch(sql, transaction_descriptor),
            ),
            RequestPayload::Rpc(rpc) => (PacketType::Rpc, rpc.encode(transaction_descriptor)),
            RequestPayload::Transaction(op) => {
                let payload = match op {
                    TmOp::Begin { isolation, name } => {
                        tman::encode_begin(transaction_descriptor, *isolation, name)
                    }
                    TmOp::Commit { name } => tman::encode_commit(transaction_descriptor, name),
                    TmOp::Rollback { name } => tman::encode_rollback(transaction_descriptor, name),
                };
                (PacketType::TransactionManager, payload)
            }
        }
    }

    /// Invoke the completion callback. `current_descriptor` is the top of
    /// the descriptor stack at completion time.
    pub(crate) fn complete(mut self, current_descriptor: u64) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        match sink {
            Sink::Completion(sink) => sink(self.error, self.row_count, self.rows),
            Sink::Transaction(sink) => sink(self.error, current_descriptor),
            Sink::Prepare(sink) => {
                let handle = self.prepared_handle();
                sink(self.error, handle);
            }
        }
    }

    /// Fail the request without sending it.
    pub(crate) fn fail(mut self, error: RequestError, current_descriptor: u64) {
        self.error = Some(error);
        self.complete(current_descriptor);
    }

    /// Extract the `sp_prepare` handle from the returned output
    /// parameters.
    fn prepared_handle(&self) -> Option<i32> {
        self.return_values
            .iter()
            .find(|rv| rv.name.trim_start_matches('@') == "handle")
            .and_then(|rv| rv.value.as_ref())
            .filter(|v| v.len() == 4)
            .map(|v| i32::from_le_bytes([v[0], v[1], v[2], v[3]]))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.payload {
            RequestPayload::SqlBatch(_) => "sqlBatch",
            RequestPayload::Rpc(_) => "rpc",
            RequestPayload::Transaction(_) => "transactionManager",
        };
        f.debug_struct("Request")
            .field("kind", &kind)
            .field("row_count", &self.row_count)
            .field("canceled", &self.canceled)
            .finish_non_exhaustive()
    }
}

/// Render the `@params` declaration string for `sp_executesql` and
/// `sp_prepare`.
fn declarations(params: &[RpcParam]) -> String {
    params
        .iter()
        .map(|p| format!("{} {}", p.name, p.value.declaration()))
        .collect::<Vec<_>>()
        .join(", ")
}
