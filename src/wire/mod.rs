//! Wire protocol: framing, message layouts, and the value codec.
//!
//! Length-prefixed binary frames over a reliable ordered byte stream. The
//! codec moves whole messages; `protocol` owns the message layouts; `values`
//! owns the scalar encoding shared by parameters and result cells.

pub mod codec;
pub mod protocol;
pub mod values;
