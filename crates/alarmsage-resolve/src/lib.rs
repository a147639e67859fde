//! Resolvers: the two retrieval paths behind the agent's tools.
//!
//! `AlarmSearch` answers "which alarm records match this code / message /
//! description"; `ManualRetriever` answers "what do the manuals for this
//! machine model say about this question".

pub mod hybrid;
pub mod manual;

#[cfg(test)]
mod testing;

pub use hybrid::{AlarmQuery, AlarmSearch};
pub use manual::{FsPageImages, ManualContext, ManualRetriever, PageImageSource, RetrieverRegistry};
