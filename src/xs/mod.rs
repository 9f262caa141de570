//! Job implementations.

mod archive;
pub mod lriterator;
#[cfg(test)]
mod lriterator_test;
mod lomcache;
#[cfg(test)]
mod lomcache_test;

use crate::xact::{XactFactory, XactKind};

/// The factories of all job kinds, to be registered with the job registry at startup.
pub fn factories() -> Vec<(XactKind, XactFactory)> {
    vec![
        (XactKind::Archive, archive::new_xact as XactFactory),
        (XactKind::LoadLomCache, lomcache::new_xact as XactFactory),
    ]
}
