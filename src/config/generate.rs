pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# SINKFLOW CONFIGURATION
# =============================================================================
# Sinkflow consumes a stream of records, groups them into per-partition batches
# and delivers each batch to a downstream writer. A partition's checkpoint only
# advances after its batch was fully written.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/sinkflow/config.yml
#   3. /etc/sinkflow/config.yml
#
# Any value may reference an environment variable with $env{NAME}.

# =============================================================================
# SOURCE
# =============================================================================
# JSON-lines input. Each non-empty line is one record. Lines that are not valid
# UTF-8 JSON are delivered as raw bytes.

source:
  # Omit to read from stdin
  path: ./solar-data.jsonl
  topic: solar-data
  # Records are spread over this many partitions; each partition is delivered
  # independently and in order
  partitions: 4
  # Payload field used as the record key. Keyed records always land on the same
  # partition.
  key_field: panel_id
  # Decode {"value": "<json string>"} envelopes
  unwrap_envelope: false

# =============================================================================
# SINK
# =============================================================================
# Batching, retry and backpressure behaviour. Every setting has a default.

sink:
  # A batch is delivered once it holds this many records...
  # Per-record HTTP sends a batch one request at a time inside a single attempt,
  # so keep max_batch_size x typical request latency well under attempt_timeout.
  # Bulk mode and the duckdb writer handle 500 and more.
  max_batch_size: 50
  # ...or once this much time passed since its first record
  max_batch_delay: 2s
  # Upper bound for a single writer attempt
  attempt_timeout: 10s
  # Retries in place after the first attempt for transient failures
  max_retries: 2
  retry_backoff:
    initial: 3s
    max: 60s
    # 1.0 gives a fixed interval
    multiplier: 2.0
  # What an attempt timeout means: 'backpressure' pauses the partition for
  # timeout_retry_after, 'retryable' retries in place
  timeout_policy: backpressure
  timeout_retry_after: 30s
  # Cumulative pause allowed per partition before giving up
  backpressure_ceiling: 10m
  # 'retry_whole' resends the whole batch when some records were rejected,
  # 'split_retry' resends only the rejected records. Downstream writes must be
  # idempotent either way.
  partial_failure: retry_whole
  # How long in-flight deliveries may take to finish on shutdown
  shutdown_grace: 15s
  # Records buffered per partition before the source is slowed down
  channel_capacity: 1000
  # Log every emitted batch at debug level
  debug_tap: false

# =============================================================================
# WRITER
# =============================================================================
# Exactly one writer. Types: http, duckdb, stdout.

writer:
  type: http
  url: https://api.example.com/data
  # 'per_record' posts each record (to url/<key_field value> when key_field is
  # set), 'bulk' posts the batch as one JSON array
  mode: per_record
  key_field: location_id
  headers:
    Authorization: Bearer $env{SINKFLOW_API_TOKEN}
  request_timeout: 10s
  # Pause requested on 429/503 responses without a Retry-After header
  backpressure_retry_after: 30s

# writer:
#   type: duckdb
#   path: ~/sinkflow/solar.duckdb
#   table: solar_data
#   columns:
#     - name: panel_id
#       type: text
#       required: true
#     - name: power_output
#       type: double
#     - name: inverter_status
#       type: text
#
# writer:
#   type: stdout

# =============================================================================
# CHECKPOINT
# =============================================================================
# Committed offsets per partition. On restart, records at or below a committed
# offset are skipped.

checkpoint:
  enabled: true
  path: ~/.local/state/sinkflow/offsets.json
  interval: 30s
"#
    .to_string()
}
