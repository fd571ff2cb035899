/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Command-line interface and engine commands.
mod cli;

/// Code related to the engine's functionality, such as user input handling.
mod engine;

/// Errors produced while searching.
mod error;

/// Evaluation of chess positions.
mod eval;

/// The interface through which search and evaluation see a chess position.
mod rules;

/// Standard Algebraic Notation.
mod san;

/// Main engine logic; all search related code.
mod search;

/// Misc utility functions, constants, and types.
mod utils;

pub use cli::*;
pub use engine::*;
pub use error::*;
pub use eval::*;
pub use rules::*;
pub use san::*;
pub use search::*;
pub use utils::*;
