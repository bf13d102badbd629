use crate::plan::OperatorId;
use crate::plan::OriginId;
use thiserror::Error;

/// An error raised by the stream processing core
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The inputs of a binary operator carry incompatible schemas
	#[error("The schemas of operator '{id}' do not agree: {message}")]
	SchemaMismatch {
		id: OperatorId,
		message: String,
	},

	/// The lowering phase encountered a logical operator it cannot translate
	#[error("The logical operator '{id}' is not supported by the physical lowering")]
	UnknownOperator {
		id: OperatorId,
	},

	/// A field name could not be resolved against a schema
	#[error("The field '{name}' does not exist in the schema")]
	UnresolvedField {
		name: String,
	},

	/// A field name matched more than one attribute during suffix resolution
	#[error("The field '{name}' is ambiguous in the schema")]
	AmbiguousField {
		name: String,
	},

	/// An attribute was defined twice within one schema
	#[error("The attribute '{name}' is already defined in the schema")]
	DuplicateAttribute {
		name: String,
	},

	/// A window or join operator was given an empty set of input origins
	#[error("The operator '{id}' has an empty set of input origins")]
	EmptyOriginSet {
		id: OperatorId,
	},

	/// The same origin id reached an operator through more than one input
	#[error("The origin '{origin}' reaches operator '{id}' more than once")]
	DuplicateOriginId {
		id: OperatorId,
		origin: OriginId,
	},

	/// A window definition is invalid and the plan was refused
	#[error("The window of operator '{id}' is invalid: {message}")]
	InvalidWindow {
		id: OperatorId,
		message: String,
	},

	/// A join input lacks the event-time attribute
	#[error("The join operator '{id}' schema does not contain a timestamp attribute")]
	JoinTimestampMissing {
		id: OperatorId,
	},

	/// A plan or operator could not be encoded into the wire format
	#[error("Cannot serialize the operator: {message}")]
	CannotSerialize {
		message: String,
	},

	/// A wire payload could not be decoded back into an operator
	#[error("Cannot deserialize the operator: {message}")]
	CannotDeserialize {
		message: String,
	},

	/// The buffer pool has a zero capacity and can never hand out a buffer
	#[error("The buffer pool is exhausted and eviction cannot make progress")]
	BufferPoolExhausted,

	/// The buffer I/O submission queue is full; the caller should retry
	#[error("Cannot submit buffer I/O; the submission queue is full")]
	CannotSubmitBufferIo,

	/// A buffer future was advanced although no result has been set
	#[error("A buffer future was continued without a result")]
	CoroutineContinuedWithoutResult,

	/// A released segment could not be handed back to the recycler
	#[error("Failed to transfer cleanup ownership of a buffer segment")]
	FailedToTransferCleanupOwnership,

	/// The spill arena ran out of file identifiers or addressable offsets
	#[error("The spill arena cannot allocate an on-disk slot: {message}")]
	SpillArenaFull {
		message: String,
	},

	/// Two runtime values cannot be combined by an operator
	#[error("Cannot apply the operator to these values: {message}")]
	InvalidArithmetic {
		message: String,
	},

	/// An execution IR function failed verification
	#[error("The execution IR is malformed: {message}")]
	MalformedIr {
		message: String,
	},

	/// A proxy call referenced a symbol which was never registered
	#[error("The proxy symbol '{symbol}' is not registered")]
	UnknownProxySymbol {
		symbol: String,
	},

	/// A runtime failure terminated the query, with full diagnostics
	#[error("Query failed at operator '{id}', origin '{origin}', watermark {watermark}: {message}")]
	QueryFailed {
		id: OperatorId,
		origin: OriginId,
		watermark: u64,
		message: String,
	},

	/// There was an underlying I/O error while spilling or reading a buffer
	#[error("There was an I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// There was an error with the underlying versioned serialization
	#[error("There was a serialization error: {0}")]
	Revision(#[from] revision::Error),
}

impl Error {
	/// Whether the caller may retry the failed operation after backoff
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::BufferPoolExhausted | Error::CannotSubmitBufferIo)
	}
}
