pub mod connectivity;
pub mod remote;
pub mod store;
pub mod sync;
