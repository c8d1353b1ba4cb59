//! The typed event sources
//!
//! Each module provides one source kind with its factory and its
//! kind-specific accessors. All handles convert to the untyped
//! [`Source`](crate::Source) through [`AsSource`](crate::AsSource), and back
//! through `TryFrom` (which hands the source back on a kind mismatch).

pub mod handler;
pub mod idle;
pub mod signal;
pub mod timer;
pub mod work;

pub use handler::Handler;
pub use idle::Idle;
pub use signal::Signal;
pub use timer::{Ticker, Timer};
pub use work::Work;

macro_rules! typed_source {
    ($name:ident, $kind:ident) => {
        impl crate::AsSource for $name {
            fn as_source(&self) -> &crate::Source {
                &self.src
            }
        }

        impl Clone for $name {
            fn clone(&self) -> $name {
                $name {
                    src: self.src.clone(),
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.src.id())
                    .finish_non_exhaustive()
            }
        }

        impl TryFrom<crate::Source> for $name {
            type Error = crate::Source;

            fn try_from(src: crate::Source) -> Result<$name, crate::Source> {
                if src.kind() == crate::SourceKind::$kind {
                    Ok($name { src })
                } else {
                    Err(src)
                }
            }
        }
    };
}

pub(crate) use typed_source;
