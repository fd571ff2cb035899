/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{fmt, str::FromStr};

use anyhow::bail;
use chessie::{Bitboard, Color, File, Piece, PieceKind, Rank, Square};

use crate::RulesProvider;

/// Score awarded for delivering checkmate.
///
/// Larger than any sum of the positional and material terms, so a mate always dominates.
pub const CHECKMATE_SCORE: i32 = 1_000_000;

/// The 2x4 block of squares at the center of the board.
pub const CENTRAL_SQUARES: [Square; 8] = [
    Square::C4,
    Square::C5,
    Square::D4,
    Square::D5,
    Square::E4,
    Square::E5,
    Square::F4,
    Square::F5,
];

/// Bonus per square a bishop can reach.
const BISHOP_MOBILITY_WEIGHT: i32 = 2;

/// File and rank steps of the four diagonals.
const DIAGONALS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];

/// Returns the value of the provided `PieceKind`.
///
/// The King's value is a sentinel: it can never be captured, but it still shows up as an attacker or a victim.
#[inline(always)]
pub const fn value_of(kind: PieceKind) -> i32 {
    match kind {
        PieceKind::Pawn => 100,
        PieceKind::Knight => 340,
        PieceKind::Bishop => 350,
        PieceKind::Rook => 500,
        PieceKind::Queen => 900,
        PieceKind::King => 20_000,
    }
}

/// How pawns on [`CENTRAL_SQUARES`] are rewarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CenterPolicy {
    /// A constant bonus per central pawn, for the whole game.
    Flat(i32),

    /// `per_move * (moves - (fullmove - 1))` per central pawn, clamped at zero.
    ///
    /// Encourages fighting for the center in the opening, and stops mattering after `moves` moves.
    Decaying { per_move: i32, moves: i32 },
}

impl CenterPolicy {
    /// The flat policy used by default.
    pub const FLAT: Self = Self::Flat(15);

    /// The opening-only policy.
    pub const DECAYING: Self = Self::Decaying {
        per_move: 10,
        moves: 11,
    };

    /// Bonus for a single central pawn on the provided fullmove number.
    #[inline(always)]
    pub fn bonus(&self, move_number: usize) -> i32 {
        match *self {
            Self::Flat(bonus) => bonus,
            Self::Decaying { per_move, moves } => {
                let played = i32::try_from(move_number.saturating_sub(1)).unwrap_or(i32::MAX);
                per_move.saturating_mul(moves.saturating_sub(played).max(0))
            }
        }
    }
}

impl Default for CenterPolicy {
    fn default() -> Self {
        Self::FLAT
    }
}

impl FromStr for CenterPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::FLAT),
            "decaying" => Ok(Self::DECAYING),
            _ => bail!("Unknown center policy {s:?}. Expected `flat` or `decaying`"),
        }
    }
}

impl fmt::Display for CenterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat(bonus) => write!(f, "flat ({bonus})"),
            Self::Decaying { per_move, moves } => {
                write!(f, "decaying ({per_move} x {moves} moves)")
            }
        }
    }
}

/// Anything that can score a position for the search.
pub trait Evaluate<P: RulesProvider> {
    /// Scores `position`. Higher is better for the side the search plays for.
    fn evaluate(&self, position: &P) -> i32;
}

/// The individual terms of an evaluation, from the engine's perspective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EvalBreakdown {
    pub material: i32,
    pub center: i32,
    pub bishop_mobility: i32,
    pub tactics: i32,
    pub checkmate: i32,
}

impl EvalBreakdown {
    /// Sum of all terms.
    #[inline(always)]
    pub const fn total(&self) -> i32 {
        self.material + self.center + self.bishop_mobility + self.tactics + self.checkmate
    }
}

impl fmt::Display for EvalBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Material:        {:>+9}", self.material)?;
        writeln!(f, "Center pawns:    {:>+9}", self.center)?;
        writeln!(f, "Bishop mobility: {:>+9}", self.bishop_mobility)?;
        writeln!(f, "Tactics:         {:>+9}", self.tactics)?;
        write!(f, "Checkmate:       {:>+9}", self.checkmate)
    }
}

/// Encapsulates the logic of scoring a chess position.
///
/// Scores are always from `engine`'s perspective, regardless of whose turn it is:
/// a high score is good for `engine`, and a low score is good for its opponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Evaluator {
    /// The side the engine is playing.
    engine: Color,

    /// How central pawns are rewarded.
    center: CenterPolicy,
}

impl Evaluator {
    /// Construct a new [`Evaluator`] scoring positions for `engine`.
    #[inline(always)]
    pub const fn new(engine: Color, center: CenterPolicy) -> Self {
        Self { engine, center }
    }

    /// The side this evaluator scores for.
    #[inline(always)]
    pub const fn engine(&self) -> Color {
        self.engine
    }

    /// The central pawn policy in use.
    #[inline(always)]
    pub const fn center(&self) -> CenterPolicy {
        self.center
    }

    /// Evaluate `position`, returning every term separately.
    pub fn breakdown<P: RulesProvider>(&self, position: &P) -> EvalBreakdown {
        let mut eval = EvalBreakdown::default();
        let center_bonus = self.center.bonus(position.move_number());

        for square in Square::iter() {
            let Some(piece) = position.piece_at(square) else {
                continue;
            };

            eval.material += self.signed(piece.color(), value_of(piece.kind()));

            if piece.is_pawn() && CENTRAL_SQUARES.contains(&square) {
                eval.center += self.signed(piece.color(), center_bonus);
            }

            if piece.is_bishop() {
                let reach = bishop_reach(position, piece, square);
                eval.bishop_mobility += self.signed(piece.color(), reach * BISHOP_MOBILITY_WEIGHT);
            }

            if let Some(gain) = capture_gain(position, piece, square) {
                // The gain belongs to whoever is attacking the piece
                eval.tactics += self.signed(piece.color().opponent(), gain);
            }
        }

        if position.is_checkmate() {
            // The side to move is the one that got mated
            eval.checkmate = if position.side_to_move() == self.engine {
                -CHECKMATE_SCORE
            } else {
                CHECKMATE_SCORE
            };
        }

        eval
    }

    /// Evaluate `position` from the engine's perspective.
    #[inline(always)]
    pub fn eval<P: RulesProvider>(&self, position: &P) -> i32 {
        self.breakdown(position).total()
    }

    /// Wraps `position` for a detailed, board-shaped printout of its evaluation.
    #[inline(always)]
    pub fn pretty<'a, P: RulesProvider>(&'a self, position: &'a P) -> PrettyEval<'a, P> {
        PrettyEval {
            evaluator: self,
            position,
        }
    }

    /// Positive if `color` is the engine, negative otherwise.
    #[inline(always)]
    fn signed(&self, color: Color, value: i32) -> i32 {
        if color == self.engine {
            value
        } else {
            -value
        }
    }
}

impl<P: RulesProvider> Evaluate<P> for Evaluator {
    #[inline(always)]
    fn evaluate(&self, position: &P) -> i32 {
        self.eval(position)
    }
}

/// Counts the squares a bishop on `square` reaches along its diagonals.
///
/// Each diagonal stops at the first occupied square, which counts as one more step only if it holds an enemy piece.
fn bishop_reach<P: RulesProvider>(position: &P, bishop: Piece, square: Square) -> i32 {
    let mut reach = 0;

    for (df, dr) in DIAGONALS {
        let mut current = square;
        while let Some(next) = current.offset(df, dr) {
            current = next;

            if let Some(blocker) = position.piece_at(current) {
                if blocker.color() != bishop.color() {
                    reach += 1;
                }
                break;
            }

            reach += 1;
        }
    }

    reach
}

/// Material the opponent of `victim` stands to win on `square`, if any.
///
/// An undefended victim is worth its full value. A defended one only yields the difference
/// between its value and the cheapest attacker, and only if that attacker is cheaper than
/// both the victim and the cheapest defender.
fn capture_gain<P: RulesProvider>(position: &P, victim: Piece, square: Square) -> Option<i32> {
    let attackers = position.attackers(victim.color().opponent(), square);
    let cheapest_attacker = cheapest(position, attackers)?;
    let victim_value = value_of(victim.kind());

    let defenders = position.attackers(victim.color(), square);
    let Some(cheapest_defender) = cheapest(position, defenders) else {
        return Some(victim_value);
    };

    (cheapest_attacker < victim_value && cheapest_attacker < cheapest_defender)
        .then_some(victim_value - cheapest_attacker)
}

/// Value of the least valuable piece on any of `squares`.
#[inline(always)]
fn cheapest<P: RulesProvider>(position: &P, squares: Bitboard) -> Option<i32> {
    squares
        .into_iter()
        .filter_map(|sq| position.piece_at(sq))
        .map(|piece| value_of(piece.kind()))
        .min()
}

/// Board-shaped printout of an evaluation, created by [`Evaluator::pretty`].
pub struct PrettyEval<'a, P> {
    evaluator: &'a Evaluator,
    position: &'a P,
}

impl<P: RulesProvider> PrettyEval<'_, P> {
    /// Material contribution of the piece on `square`, if one exists.
    #[inline(always)]
    fn value_at(&self, square: Square) -> Option<i32> {
        self.position
            .piece_at(square)
            .map(|piece| self.evaluator.signed(piece.color(), value_of(piece.kind())))
    }
}

impl<P: RulesProvider> fmt::Display for PrettyEval<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  +")?;
        for _ in File::iter() {
            write!(f, "-------+")?;
        }
        writeln!(f)?;

        for rank in Rank::iter().rev() {
            write!(f, "{rank} |")?;

            // Step 1: Write the piece char
            for file in File::iter() {
                let square = Square::new(file, rank);
                let piece_char = self.position.piece_at(square).map(|p| p.char()).unwrap_or(' ');
                write!(f, "   {piece_char}   |")?;
            }
            writeln!(f)?;
            write!(f, "  |")?;

            // Step 2: Write the material contribution of that piece
            for file in File::iter() {
                let square = Square::new(file, rank);
                let cell = match self.value_at(square) {
                    Some(val) => format!("{val:+}"),
                    None => String::new(),
                };
                write!(f, "{cell:^7}|")?;
            }
            writeln!(f)?;

            write!(f, "  +")?;
            for _ in File::iter() {
                write!(f, "-------+")?;
            }
            writeln!(f)?;
        }
        for file in File::iter() {
            write!(f, "       {file}")?;
        }

        let breakdown = self.evaluator.breakdown(self.position);
        let engine = self.evaluator.engine();
        let score = breakdown.total();

        let winning_side = if score > 0 {
            Some(engine)
        } else if score < 0 {
            Some(engine.opponent())
        } else {
            None
        };

        writeln!(f, "\n\nPerspective: {}", engine.name())?;
        writeln!(f, "Center policy: {}", self.evaluator.center())?;
        writeln!(f, "{breakdown}")?;
        writeln!(
            f,
            "Winning side: {}",
            winning_side.map(|c| c.name()).unwrap_or("N/A")
        )?;
        write!(f, "Score: {score}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChessBoard;

    fn breakdown(fen: &str, engine: Color) -> EvalBreakdown {
        let board: ChessBoard = fen.parse().unwrap();
        Evaluator::new(engine, CenterPolicy::FLAT).breakdown(&board)
    }

    #[test]
    fn test_startpos_is_balanced() {
        let board = ChessBoard::default();
        for engine in Color::all() {
            let eval = Evaluator::new(engine, CenterPolicy::FLAT).breakdown(&board);
            assert_eq!(eval, EvalBreakdown::default());
            assert_eq!(eval.total(), 0);
        }
    }

    #[test]
    fn test_material_is_from_engine_perspective() {
        let fen = "4k3/8/8/8/8/8/8/3QK3 w - - 0 1";
        assert_eq!(breakdown(fen, Color::White).material, 900);
        assert_eq!(breakdown(fen, Color::Black).material, -900);
    }

    #[test]
    fn test_flat_center_bonus() {
        let eval = breakdown("4k3/8/8/8/4P3/8/8/4K3 w - - 0 1", Color::White);
        assert_eq!(eval.center, 15);
        assert_eq!(eval.material, 100);
        assert_eq!(eval.total(), 115);

        let eval = breakdown("4k3/8/8/3p4/4P3/8/8/4K3 w - - 0 1", Color::Black);
        assert_eq!(eval.center, 0);
    }

    #[test]
    fn test_decaying_center_bonus() {
        let policy = CenterPolicy::DECAYING;
        assert_eq!(policy.bonus(1), 110);
        assert_eq!(policy.bonus(2), 100);
        assert_eq!(policy.bonus(11), 10);
        assert_eq!(policy.bonus(12), 0);
        assert_eq!(policy.bonus(80), 0);

        assert_eq!(CenterPolicy::FLAT.bonus(1), 15);
        assert_eq!(CenterPolicy::FLAT.bonus(80), 15);

        let board: ChessBoard = "4k3/8/8/8/4P3/8/8/4K3 w - - 0 5".parse().unwrap();
        let eval = Evaluator::new(Color::White, policy).breakdown(&board);
        assert_eq!(eval.center, 70);

        // Move numbers beyond `i32::MAX` clamp to zero instead of overflowing
        assert_eq!(policy.bonus(usize::MAX), 0);
        let board: ChessBoard = "4k3/8/8/8/4P3/8/8/4K3 w - - 0 2147483649".parse().unwrap();
        let eval = Evaluator::new(Color::White, policy).breakdown(&board);
        assert_eq!(eval.center, 0);
        assert_eq!(eval.material, 100);
    }

    #[test]
    fn test_center_policy_from_str() {
        assert_eq!("flat".parse::<CenterPolicy>().unwrap(), CenterPolicy::FLAT);
        assert_eq!("Decaying".parse::<CenterPolicy>().unwrap(), CenterPolicy::DECAYING);
        assert!("linear".parse::<CenterPolicy>().is_err());
    }

    #[test]
    fn test_bishop_mobility() {
        // Open bishop: d2 e3 f4 g5 h6 + b2 a3
        assert_eq!(breakdown("4k3/8/8/8/8/8/8/2B1K3 w - - 0 1", Color::White).bishop_mobility, 14);

        // An enemy blocker counts as one step
        assert_eq!(breakdown("4k3/8/8/8/8/8/3p4/2B1K3 w - - 0 1", Color::White).bishop_mobility, 6);

        // A friendly blocker does not
        assert_eq!(breakdown("4k3/8/8/8/8/8/3P4/2B1K3 w - - 0 1", Color::White).bishop_mobility, 4);

        // Opponent bishops count against the engine
        assert_eq!(breakdown("4k3/8/8/8/8/8/8/2B1K3 w - - 0 1", Color::Black).bishop_mobility, -14);
    }

    #[test]
    fn test_undefended_piece_is_a_free_capture() {
        let fen = "4k3/8/8/3n4/8/8/8/3RK3 w - - 0 1";
        assert_eq!(breakdown(fen, Color::White).tactics, 340);
        assert_eq!(breakdown(fen, Color::Black).tactics, -340);
    }

    #[test]
    fn test_profitable_trade_on_defended_piece() {
        // Pawn takes knight, recapture with the rook
        let fen = "3rk3/8/8/3n4/4P3/8/8/4K3 w - - 0 1";
        assert_eq!(breakdown(fen, Color::White).tactics, 240);
    }

    #[test]
    fn test_defender_as_cheap_as_attacker_cancels_trade() {
        // Pawn takes knight, pawn recaptures
        let fen = "4k3/8/4p3/3n4/4P3/8/8/4K3 w - - 0 1";
        assert_eq!(breakdown(fen, Color::White).tactics, 0);
    }

    #[test]
    fn test_checkmate_dominates() {
        let fools_mate = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
        assert_eq!(breakdown(fools_mate, Color::Black).checkmate, CHECKMATE_SCORE);
        assert_eq!(breakdown(fools_mate, Color::White).checkmate, -CHECKMATE_SCORE);
        assert!(breakdown(fools_mate, Color::Black).total() > CHECKMATE_SCORE / 2);
    }

    #[test]
    fn test_pretty_printing() {
        let board = ChessBoard::default();
        let evaluator = Evaluator::new(Color::Black, CenterPolicy::FLAT);
        let printed = evaluator.pretty(&board).to_string();

        assert!(printed.contains("Perspective: "));
        assert!(printed.contains("Score: 0"));
        assert!(printed.contains("-20000"));
    }
}
