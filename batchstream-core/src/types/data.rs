//! Types and traits for data processed in Batchstream

/// Data which may move through a stream
#[diagnostic::on_unimplemented(message = "Type must be `Clone + Send + 'static` to be used as data")]
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}
