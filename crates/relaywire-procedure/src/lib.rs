//! Procedure definitions for relaywire servers.
//!
//! A procedure is a named, immutable pair of an input [`Parser`] and a
//! resolver. It is either [`Procedure::Standard`] (one result) or
//! [`Procedure::Streaming`] (a sequence of results), and is built with
//! [`input`]:
//!
//! ```rust
//! use relaywire_procedure::{input, Json, Procedure, ProcedureTable};
//!
//! #[derive(serde::Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! let add: Procedure<()> = input(Json::<Add>::new())
//!     .resolve(|_ctx, Add { a, b }| async move {
//!         Ok::<_, String>(a + b)
//!     });
//!
//! let table = ProcedureTable::new().with("add", add);
//! assert_eq!(table.names(), ["add"]);
//! ```
//!
//! The context type `Ctx` is chosen by the server; procedures never see
//! the connection directly.

mod error;
mod parser;
mod procedure;
mod table;

pub use error::{ProcedureError, ValidationError};
pub use parser::{FnParser, Json, NoInput, Parser, parser_fn};
pub use procedure::{
    Procedure, ProcedureBuilder, ProcedureKind, ProcedureStream, StandardFn,
    StreamingFn, input,
};
pub use table::ProcedureTable;
