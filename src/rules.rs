/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{
    fmt,
    ops::{Deref, DerefMut},
    str::FromStr,
};

use anyhow::Result;
use chessie::{
    bishop_attacks, king_attacks, knight_attacks, pawn_attacks, rook_attacks, Bitboard, Color,
    Game, Move, Piece, PieceKind, Square,
};

use crate::SearchError;

/// Number of halfmoves without a capture or pawn move after which the game is drawn automatically.
const SEVENTY_FIVE_MOVE_RULE: usize = 150;

/// Number of occurrences of the same position after which the game is drawn automatically.
const FIVEFOLD_REPETITION: usize = 5;

/// The narrow view of a chess position that the evaluator and the search operate on.
///
/// Implementors own all of the rules of chess: move generation, legality, and attack tables.
/// The search mutates the position exclusively through [`RulesProvider::apply`] and [`RulesProvider::undo`],
/// and every `apply` is paired with exactly one `undo` through [`Played`].
pub trait RulesProvider {
    /// A move that is legal in the position it was enumerated from.
    type Move: Copy + PartialEq + fmt::Debug + fmt::Display;

    /// A comparable copy of the current state.
    ///
    /// Taking a move back must restore a state whose snapshot equals the one taken before the move.
    type Snapshot: PartialEq + fmt::Debug;

    /// All legal moves in the current position, in the provider's enumeration order.
    fn legal_moves(&self) -> Vec<Self::Move>;

    /// Plays `mv` on the current position.
    fn apply(&mut self, mv: Self::Move);

    /// Takes back the most recently applied move.
    fn undo(&mut self) -> Result<(), SearchError>;

    /// Number of moves currently applied that can be undone.
    fn ply(&self) -> usize;

    /// The piece on `square`, if any.
    fn piece_at(&self, square: Square) -> Option<Piece>;

    /// All squares holding a piece of `color` that attacks `square`.
    fn attackers(&self, color: Color, square: Square) -> Bitboard;

    /// The side whose turn it is.
    fn side_to_move(&self) -> Color;

    /// The fullmove counter, starting at 1 and incremented after Black moves.
    fn move_number(&self) -> usize;

    /// Returns `true` if the side to move has been checkmated.
    fn is_checkmate(&self) -> bool;

    /// Returns `true` if the game has ended, by mate or by a draw.
    fn is_game_over(&self) -> bool;

    /// Captures the current state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Applies `mv`, returning a guard that takes it back when dropped.
    #[inline(always)]
    fn play(&mut self, mv: Self::Move) -> Played<'_, Self>
    where
        Self: Sized,
    {
        Played::new(self, mv)
    }
}

/// A move applied to a [`RulesProvider`] for as long as this guard lives.
///
/// Dropping the guard undoes the move, so an early return can never leave the position mutated.
pub struct Played<'a, P: RulesProvider> {
    position: &'a mut P,
}

impl<'a, P: RulesProvider> Played<'a, P> {
    /// Applies `mv` to `position`.
    #[inline(always)]
    pub fn new(position: &'a mut P, mv: P::Move) -> Self {
        position.apply(mv);
        Self { position }
    }
}

impl<P: RulesProvider> Deref for Played<'_, P> {
    type Target = P;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.position
    }
}

impl<P: RulesProvider> DerefMut for Played<'_, P> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.position
    }
}

impl<P: RulesProvider> Drop for Played<'_, P> {
    fn drop(&mut self) {
        // The search double-checks the ply after every guarded block, so this is reported there too.
        if let Err(err) = self.position.undo() {
            log::error!("Failed to take back a played move: {err}");
        }
    }
}

/// The outcome of a finished game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameResult {
    WhiteWins,
    BlackWins,
    Draw,
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WhiteWins => "1-0",
            Self::BlackWins => "0-1",
            Self::Draw => "1/2-1/2",
        };

        write!(f, "{s}")
    }
}

/// A chess position backed by [`chessie`], with a history of prior positions so that moves can be taken back.
#[derive(Clone, PartialEq, Eq)]
pub struct ChessBoard {
    /// The current state of the game.
    game: Game,

    /// Every position before `game`, most recent last.
    history: Vec<Game>,
}

impl ChessBoard {
    /// Wraps `game` with an empty history.
    #[inline(always)]
    pub fn new(game: Game) -> Self {
        Self {
            game,
            history: Vec::with_capacity(64),
        }
    }

    /// Creates a new [`ChessBoard`] from the provided FEN string.
    pub fn from_fen(fen: &str) -> Result<Self> {
        Ok(Self::new(Game::from_fen(fen)?))
    }

    /// The current position.
    #[inline(always)]
    pub const fn game(&self) -> &Game {
        &self.game
    }

    /// Generates a FEN string of the current position.
    #[inline(always)]
    pub fn to_fen(&self) -> String {
        self.game.to_fen()
    }

    /// Returns `true` if the side to move is in check.
    #[inline(always)]
    pub fn is_in_check(&self) -> bool {
        self.game.is_in_check()
    }

    /// The result of the game, if it has ended.
    pub fn result(&self) -> Option<GameResult> {
        if self.game.get_legal_moves().is_empty() {
            if self.game.is_in_check() {
                // The side to move has been mated
                return Some(match self.game.side_to_move() {
                    Color::White => GameResult::BlackWins,
                    Color::Black => GameResult::WhiteWins,
                });
            }

            // Stalemate
            return Some(GameResult::Draw);
        }

        if self.has_insufficient_material()
            || self.game.halfmove() >= SEVENTY_FIVE_MOVE_RULE
            || self.repetitions() >= FIVEFOLD_REPETITION
        {
            return Some(GameResult::Draw);
        }

        None
    }

    /// Number of times the current position has occurred in this game, including now.
    ///
    /// Positions are compared by placement, side to move, castling rights and en passant square.
    pub fn repetitions(&self) -> usize {
        let current = repetition_key(&self.game);

        1 + self
            .history
            .iter()
            .filter(|game| repetition_key(game) == current)
            .count()
    }

    /// Returns `true` if neither side can possibly deliver mate.
    ///
    /// Covers bare Kings, a King with a single minor piece against a bare King,
    /// and any number of Bishops that all stand on squares of one color.
    fn has_insufficient_material(&self) -> bool {
        let parts = |kind| {
            Color::all()
                .into_iter()
                .fold(Bitboard::default(), |bb, color| bb | self.game.piece_parts(color, kind))
        };

        let heavy_or_pawns = [PieceKind::Pawn, PieceKind::Rook, PieceKind::Queen]
            .into_iter()
            .any(|kind| parts(kind).is_nonempty());
        if heavy_or_pawns {
            return false;
        }

        if self.game.occupied().population() <= 3 {
            return true;
        }

        let bishops = parts(PieceKind::Bishop);
        parts(PieceKind::Knight).is_empty()
            && ((bishops & Bitboard::DARK_SQUARES).is_empty()
                || (bishops & Bitboard::LIGHT_SQUARES).is_empty())
    }
}

/// The FEN of `game` without its move counters.
fn repetition_key(game: &Game) -> String {
    game.to_fen()
        .split_ascii_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}

impl RulesProvider for ChessBoard {
    type Move = Move;
    type Snapshot = Game;

    #[inline(always)]
    fn legal_moves(&self) -> Vec<Move> {
        self.game.get_legal_moves().into_iter().collect()
    }

    #[inline(always)]
    fn apply(&mut self, mv: Move) {
        self.history.push(self.game);
        self.game = self.game.with_move_made(mv);
    }

    #[inline(always)]
    fn undo(&mut self) -> Result<(), SearchError> {
        self.game = self.history.pop().ok_or_else(|| {
            SearchError::RulesProviderInconsistency(String::from(
                "attempted to undo a move with no moves applied",
            ))
        })?;

        Ok(())
    }

    #[inline(always)]
    fn ply(&self) -> usize {
        self.history.len()
    }

    #[inline(always)]
    fn piece_at(&self, square: Square) -> Option<Piece> {
        self.game.piece_at(square)
    }

    fn attackers(&self, color: Color, square: Square) -> Bitboard {
        let blockers = self.game.occupied();
        let parts = |kind| self.game.piece_parts(color, kind);
        let queens = parts(PieceKind::Queen);

        // A pawn of `color` attacks `square` from wherever a pawn of the opposite color on `square` would attack
        (pawn_attacks(square, color.opponent()) & parts(PieceKind::Pawn))
            | (knight_attacks(square) & parts(PieceKind::Knight))
            | (bishop_attacks(square, blockers) & (parts(PieceKind::Bishop) | queens))
            | (rook_attacks(square, blockers) & (parts(PieceKind::Rook) | queens))
            | (king_attacks(square) & parts(PieceKind::King))
    }

    #[inline(always)]
    fn side_to_move(&self) -> Color {
        self.game.side_to_move()
    }

    #[inline(always)]
    fn move_number(&self) -> usize {
        self.game.fullmove()
    }

    #[inline(always)]
    fn is_checkmate(&self) -> bool {
        self.game.is_in_check() && self.game.get_legal_moves().is_empty()
    }

    #[inline(always)]
    fn is_game_over(&self) -> bool {
        self.result().is_some()
    }

    #[inline(always)]
    fn snapshot(&self) -> Game {
        self.game
    }
}

impl Default for ChessBoard {
    fn default() -> Self {
        Self::new(Game::default())
    }
}

impl FromStr for ChessBoard {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_fen(s)
    }
}

impl fmt::Display for ChessBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.game)
    }
}

impl fmt::Debug for ChessBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChessBoard")
            .field("fen", &self.to_fen())
            .field("ply", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(fen: &str) -> ChessBoard {
        fen.parse().unwrap()
    }

    #[test]
    fn test_apply_undo_restores_position() {
        let mut position = ChessBoard::default();
        let original = position.clone();

        for mv in position.legal_moves() {
            {
                let played = position.play(mv);
                assert_eq!(played.ply(), 1);
                assert_ne!(played.game(), original.game());
            }
            assert_eq!(position, original, "{mv} was not taken back");
        }
    }

    #[test]
    fn test_undo_without_history_is_inconsistent() {
        let mut position = ChessBoard::default();
        assert!(matches!(
            position.undo(),
            Err(SearchError::RulesProviderInconsistency(_))
        ));
    }

    #[test]
    fn test_attackers_of_square() {
        // White knight on c3 and pawn on d3 both hit e4, rook on e1 is blocked by the e2 pawn
        let position = board("4k3/8/8/8/4p3/2NP4/4P3/4R1K1 w - - 0 1");
        let attackers = position.attackers(Color::White, Square::E4);

        assert_eq!(attackers.population(), 2);
        assert!(attackers.intersects(Square::C3));
        assert!(attackers.intersects(Square::D3));
        assert!(position.attackers(Color::Black, Square::E4).is_empty());
    }

    #[test]
    fn test_queen_attacks_along_both_rays() {
        let position = board("4k3/8/8/8/8/8/8/Q3K3 w - - 0 1");
        assert!(position.attackers(Color::White, Square::H8).intersects(Square::A1));
        assert!(position.attackers(Color::White, Square::A8).intersects(Square::A1));
        assert!(position.attackers(Color::White, Square::B3).is_empty());
    }

    #[test]
    fn test_checkmate_result() {
        // Fool's mate
        let position = board("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3");
        assert!(position.is_checkmate());
        assert!(position.is_game_over());
        assert_eq!(position.result(), Some(GameResult::BlackWins));
        assert_eq!(position.result().unwrap().to_string(), "0-1");
    }

    #[test]
    fn test_stalemate_result() {
        let position = board("k7/8/KQ6/8/8/8/8/8 b - - 0 1");
        assert!(!position.is_checkmate());
        assert_eq!(position.result(), Some(GameResult::Draw));
    }

    #[test]
    fn test_insufficient_material() {
        assert_eq!(board("4k3/8/8/8/8/8/8/2B1K3 w - - 0 1").result(), Some(GameResult::Draw));
        assert_eq!(board("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").result(), None);
    }

    #[test]
    fn test_same_colored_bishops_are_insufficient() {
        // Both bishops on dark squares
        let position = board("4k3/8/8/4b3/8/8/3B4/4K3 w - - 0 1");
        assert_eq!(position.result(), Some(GameResult::Draw));

        let position = board("4k3/8/8/8/8/8/1B1B4/4K3 w - - 0 1");
        assert_eq!(position.result(), Some(GameResult::Draw));

        // Opposite colors can still mate
        assert_eq!(board("4k3/8/8/3b4/8/8/3B4/4K3 w - - 0 1").result(), None);

        // A knight next to the bishops can too
        assert_eq!(board("4k3/8/8/4b3/8/8/3B4/4KN2 w - - 0 1").result(), None);
    }

    #[test]
    fn test_fivefold_repetition() {
        let mut position = ChessBoard::default();
        let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8"];

        for round in 1..=4 {
            assert_eq!(position.result(), None, "round {round}");

            for uci in shuffle {
                let mv = position
                    .legal_moves()
                    .into_iter()
                    .find(|mv| mv.to_string() == uci)
                    .unwrap();
                position.apply(mv);
            }

            assert_eq!(position.repetitions(), round + 1);
        }

        // The starting position has now occurred five times
        assert_eq!(position.result(), Some(GameResult::Draw));
        assert!(position.is_game_over());

        // Taking a move back leaves the fifth occurrence behind
        position.undo().unwrap();
        assert_eq!(position.result(), None);
    }

    #[test]
    fn test_startpos_is_not_over() {
        let position = ChessBoard::default();
        assert_eq!(position.legal_moves().len(), 20);
        assert_eq!(position.side_to_move(), Color::White);
        assert_eq!(position.move_number(), 1);
        assert!(!position.is_game_over());
    }
}
