//! Fine-grained status enums and their phase mapping.
//!
//! A domain declares its statuses once with [`processing_status!`](crate::processing_status);
//! the macro generates the enum, the phase mapping, stable storage codes and
//! `Display`. Storage backends persist [`ProcessingStatus::code`] and resolve it
//! back with [`ProcessingStatus::from_code`].

use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use crate::error::{CoreError, CoreResult};
use crate::phase::ProcessingPhase;

/// A closed set of statuses, each mapped to exactly one [`ProcessingPhase`].
pub trait ProcessingStatus:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// Name used in error messages.
    const TYPE_NAME: &'static str;

    /// The phase this status belongs to. Must be a pure lookup.
    fn processing_phase(&self) -> ProcessingPhase;

    /// Stable code used when the status is persisted.
    fn code(&self) -> &'static str;

    /// Every status of the enum, in declaration order.
    fn all() -> &'static [Self];

    /// Resolve a persisted code.
    fn from_code(code: &str) -> CoreResult<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|s| s.code() == code)
            .ok_or_else(|| CoreError::unknown_status(Self::TYPE_NAME, code))
    }

    fn is_terminal(&self) -> bool {
        self.processing_phase().is_terminal()
    }
}

/// All statuses of `S` that belong to `phase`.
pub fn statuses_in_phase<S: ProcessingStatus>(phase: ProcessingPhase) -> HashSet<S> {
    S::all()
        .iter()
        .copied()
        .filter(|s| s.processing_phase() == phase)
        .collect()
}

/// All statuses of `S` in the PENDING phase.
pub fn pending_statuses<S: ProcessingStatus>() -> HashSet<S> {
    statuses_in_phase(ProcessingPhase::Pending)
}

/// Declare a status enum together with its [`ProcessingStatus`] implementation.
///
/// ```
/// objproc_core::processing_status! {
///     /// Lifecycle of an export.
///     pub enum ExportStatus {
///         Queued = "QUEUED" => Pending,
///         Exporting = "EXPORTING" => Processing,
///         Exported = "EXPORTED" => Completed,
///         Rejected = "REJECTED" => Failed,
///     }
/// }
///
/// use objproc_core::{ProcessingPhase, ProcessingStatus};
/// assert_eq!(ExportStatus::Queued.processing_phase(), ProcessingPhase::Pending);
/// assert_eq!(ExportStatus::from_code("EXPORTED").unwrap(), ExportStatus::Exported);
/// ```
#[macro_export]
macro_rules! processing_status {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $code:literal => $phase:ident
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant
            ),+
        }

        impl $crate::ProcessingStatus for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn processing_phase(&self) -> $crate::ProcessingPhase {
                match self {
                    $( Self::$variant => $crate::ProcessingPhase::$phase ),+
                }
            }

            fn code(&self) -> &'static str {
                match self {
                    $( Self::$variant => $code ),+
                }
            }

            fn all() -> &'static [Self] {
                &[ $( Self::$variant ),+ ]
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str($crate::ProcessingStatus::code(self))
            }
        }
    };
}
