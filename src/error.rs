/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use thiserror::Error;

/// Errors that can occur while selecting a move.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The beam width or the number of narrowing rounds was zero.
    #[error("invalid search configuration: width {width} and depth {depth} must both be positive")]
    InvalidConfiguration { width: usize, depth: usize },

    /// The search was started on a position without any legal moves.
    ///
    /// Callers are expected to check for the end of the game before searching.
    #[error("cannot search a position with no legal moves")]
    NoLegalMoves,

    /// An apply/undo pair did not restore the position it started from.
    #[error("rules provider is in an inconsistent state: {0}")]
    RulesProviderInconsistency(String),

    /// The search was stopped before a single round had completed.
    #[error("search aborted: {0}")]
    Aborted(String),
}
