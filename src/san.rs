/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{bail, Result};
use chessie::{Move, PieceKind};

use crate::{ChessBoard, RulesProvider};

/// Formats `mv` in [Standard Algebraic Notation](https://en.wikipedia.org/wiki/Algebraic_notation_(chess)).
///
/// `mv` must be legal in `board`'s current position.
pub fn to_san(board: &ChessBoard, mv: Move) -> String {
    let mut san = san_body(board, mv);

    let after = board.game().with_move_made(mv);
    if after.is_in_check() {
        san.push(if after.get_legal_moves().is_empty() {
            '#'
        } else {
            '+'
        });
    }

    san
}

/// Parses user input into a legal move of `board`'s current position.
///
/// Accepts SAN (`Nf3`, `exd5`, `O-O`, `e8=Q+`) as well as UCI long algebraic notation (`g1f3`).
/// Check and annotation suffixes are optional, and castling may be written with zeros.
pub fn parse_move(board: &ChessBoard, input: &str) -> Result<Move> {
    let wanted = normalize(input);
    if wanted.is_empty() {
        bail!("Empty move string");
    }

    let moves = board.legal_moves();

    if let Some(mv) = moves
        .iter()
        .copied()
        .find(|&mv| normalize(&san_body(board, mv)) == wanted)
    {
        return Ok(mv);
    }

    // Fall back to UCI notation
    let uci = input.trim();
    if let Some(mv) = moves.into_iter().find(|mv| mv.to_string() == uci) {
        return Ok(mv);
    }

    bail!("{input:?} is not a legal move in {}", board.to_fen())
}

/// SAN without the check/mate suffix.
fn san_body(board: &ChessBoard, mv: Move) -> String {
    if mv.is_short_castle() {
        return String::from("O-O");
    }
    if mv.is_long_castle() {
        return String::from("O-O-O");
    }

    let Some(piece) = board.piece_at(mv.from()) else {
        return mv.to_string();
    };

    let mut san = String::with_capacity(8);
    let kind = piece.kind();

    if kind == PieceKind::Pawn {
        if mv.is_capture() {
            san.push(mv.from().file().char());
            san.push('x');
        }
        san.push_str(&mv.to().to_string());

        if let Some(promotion) = mv.promotion() {
            san.push('=');
            san.push(promotion.char().to_ascii_uppercase());
        }

        return san;
    }

    san.push(kind.char().to_ascii_uppercase());

    // Other pieces of the same kind that can reach the same square
    let rivals = board
        .legal_moves()
        .into_iter()
        .filter(|other| {
            other.to() == mv.to()
                && other.from() != mv.from()
                && board.piece_at(other.from()).map(|p| p.kind()) == Some(kind)
        })
        .map(|other| other.from())
        .collect::<Vec<_>>();

    if !rivals.is_empty() {
        let from = mv.from();
        if rivals.iter().all(|sq| sq.file() != from.file()) {
            san.push(from.file().char());
        } else if rivals.iter().all(|sq| sq.rank() != from.rank()) {
            san.push(from.rank().char());
        } else {
            san.push_str(&from.to_string());
        }
    }

    if mv.is_capture() {
        san.push('x');
    }
    san.push_str(&mv.to().to_string());

    san
}

/// Strips check/annotation suffixes and promotion `=` signs, and maps zero-castling to letter-castling.
fn normalize(s: &str) -> String {
    s.trim()
        .trim_end_matches(['+', '#', '!', '?'])
        .replace('0', "O")
        .replace('=', "")
}
