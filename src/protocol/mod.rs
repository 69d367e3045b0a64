//! Wire model: requests, result sets and the frame codec.

mod codec;
mod request;
mod result;

pub use codec::{Codec, Compression, Format, Frame};
pub use request::{Request, RequestId, RequestType, PASSWORD, PROCEDURE_NAME, USERNAME};
pub use result::{Paging, ResultSet};
