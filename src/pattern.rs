//! User-authored pattern expressions.
//!
//! A pattern is a pure function of `(t, x, prev_color)` written in a small
//! expression language with a fixed vocabulary: arithmetic, waveforms,
//! plasma, noise and palette lookups. Sources are compiled to a tree that
//! evaluates in bounded time with no I/O, which keeps per-frame cost
//! deterministic.

use std::{collections::HashMap, error::Error, fmt, sync::Arc};

use crate::{
    color::Rgb,
    noise::{fbm, perlin},
    palette::Palette,
    waveform::{cubic, plasma, plasma_octaves, pulse, sine, triangle, PLASMA_DEFAULT_COEFFS},
};

/// A compile diagnostic with the byte offset it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at offset {}: {}", self.position, self.message)
    }
}

impl Error for CompileError {}

/// Raised when a pattern produces a non-finite value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for EvalError {}

/// What a pattern call produced for one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternOutput {
    /// A position to sample from the group's palette.
    PalettePosition(f32),
    /// A direct color.
    Color(Rgb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    T,
    X,
    PrevR,
    PrevG,
    PrevB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Pulse,
    Triangle,
    Sine,
    Cubic,
    Plasma,
    PlasmaOctaves,
    Noise,
    Fbm,
    Palette,
    PaletteRgb,
    Hsv,
    Rgb,
    Abs,
    Min,
    Max,
    Clamp,
    Frac,
    Floor,
    Pow,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "pulse" => Self::Pulse,
            "triangle" => Self::Triangle,
            "sine" => Self::Sine,
            "cubic" => Self::Cubic,
            "plasma" => Self::Plasma,
            "plasma_octaves" => Self::PlasmaOctaves,
            "noise" => Self::Noise,
            "fbm" => Self::Fbm,
            "palette" => Self::Palette,
            "palette_rgb" => Self::PaletteRgb,
            "hsv" => Self::Hsv,
            "rgb" => Self::Rgb,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "clamp" => Self::Clamp,
            "frac" => Self::Frac,
            "floor" => Self::Floor,
            "pow" => Self::Pow,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Triangle | Self::Sine | Self::Cubic | Self::Abs | Self::Frac | Self::Floor => 1,
            Self::Palette | Self::PaletteRgb => 1,
            Self::Pulse | Self::Min | Self::Max | Self::Pow | Self::Plasma => 2,
            Self::Noise | Self::Clamp | Self::Hsv | Self::Rgb => 3,
            Self::Fbm => 4,
            Self::PlasmaOctaves => 5,
        }
    }

    fn returns_color(self) -> bool {
        matches!(
            self,
            Self::Palette | Self::PaletteRgb | Self::Hsv | Self::Rgb
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f32),
    Var(Var),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f32),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn lex(source: &str) -> Result<Vec<(usize, Token)>, CompileError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((i, Token::Slash));
                i += 1;
            }
            '%' => {
                tokens.push((i, Token::Percent));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &source[start..i];
                let value = text.parse::<f32>().map_err(|_| CompileError {
                    position: start,
                    message: format!("invalid number '{text}'"),
                })?;
                tokens.push((start, Token::Num(value)));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(source[start..i].to_string())));
            }
            other => {
                return Err(CompileError {
                    position: i,
                    message: format!("unexpected character '{other}'"),
                })
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    source_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.source_len, |(p, _)| *p)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t);
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), CompileError> {
        let position = self.position();
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            _ => Err(CompileError {
                position,
                message: format!("expected {what}"),
            }),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let position = self.position();
        match self.advance().cloned() {
            Some(Token::Num(value)) => Ok(Expr::Num(value)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let func = Func::from_name(&name).ok_or_else(|| CompileError {
                        position,
                        message: format!("unknown function '{name}'"),
                    })?;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.parse_expr()?);
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    if args.len() != func.arity() {
                        return Err(CompileError {
                            position,
                            message: format!(
                                "'{name}' takes {} arguments, got {}",
                                func.arity(),
                                args.len()
                            ),
                        });
                    }
                    Ok(Expr::Call(func, args))
                } else {
                    let var = match name.as_str() {
                        "t" => Var::T,
                        "x" => Var::X,
                        "prev_r" => Var::PrevR,
                        "prev_g" => Var::PrevG,
                        "prev_b" => Var::PrevB,
                        _ => {
                            return Err(CompileError {
                                position,
                                message: format!("unknown variable '{name}'"),
                            })
                        }
                    };
                    Ok(Expr::Var(var))
                }
            }
            _ => Err(CompileError {
                position,
                message: "expected expression".to_string(),
            }),
        }
    }
}

/// Colors may only appear as the top-level result; inside arithmetic or as
/// function arguments every value must be numeric.
fn check_numeric(expr: &Expr) -> Result<(), CompileError> {
    match expr {
        Expr::Num(_) | Expr::Var(_) => Ok(()),
        Expr::Neg(inner) => check_numeric(inner),
        Expr::Binary(_, a, b) => {
            check_numeric(a)?;
            check_numeric(b)
        }
        Expr::Call(func, args) => {
            if func.returns_color() {
                return Err(CompileError {
                    position: 0,
                    message: "color value used in numeric context".to_string(),
                });
            }
            args.iter().try_for_each(check_numeric)
        }
    }
}

fn check_types(expr: &Expr) -> Result<(), CompileError> {
    match expr {
        Expr::Call(_, args) => args.iter().try_for_each(check_numeric),
        other => check_numeric(other),
    }
}

// ---------------------------------------------------------------------------
// Evaluation

/// Per-pixel inputs supplied by the renderer.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub t: f32,
    pub x: f32,
    pub prev: Rgb,
    pub palette: &'a Palette,
}

fn eval_num(expr: &Expr, ctx: &EvalContext<'_>) -> f32 {
    match expr {
        Expr::Num(value) => *value,
        Expr::Var(var) => match var {
            Var::T => ctx.t,
            Var::X => ctx.x,
            Var::PrevR => ctx.prev.r,
            Var::PrevG => ctx.prev.g,
            Var::PrevB => ctx.prev.b,
        },
        Expr::Neg(inner) => -eval_num(inner, ctx),
        Expr::Binary(op, a, b) => {
            let a = eval_num(a, ctx);
            let b = eval_num(b, ctx);
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a.rem_euclid(b),
            }
        }
        Expr::Call(func, args) => {
            let arg = |i: usize| eval_num(&args[i], ctx);
            match func {
                Func::Pulse => pulse(arg(0), arg(1)),
                Func::Triangle => triangle(arg(0)),
                Func::Sine => sine(arg(0)),
                Func::Cubic => cubic(arg(0)),
                Func::Plasma => plasma(arg(0), arg(1), PLASMA_DEFAULT_COEFFS),
                Func::PlasmaOctaves => {
                    plasma_octaves(arg(0), arg(1), arg(2).max(1.0) as u32, arg(3), arg(4))
                }
                Func::Noise => perlin(arg(0), arg(1), arg(2)),
                Func::Fbm => fbm(arg(0), arg(1), arg(2), arg(3).max(1.0) as u32),
                Func::Abs => arg(0).abs(),
                Func::Min => arg(0).min(arg(1)),
                Func::Max => arg(0).max(arg(1)),
                Func::Clamp => {
                    let lo = arg(1);
                    let hi = arg(2);
                    if lo <= hi {
                        arg(0).clamp(lo, hi)
                    } else {
                        lo
                    }
                }
                Func::Frac => arg(0).rem_euclid(1.0),
                Func::Floor => arg(0).floor(),
                Func::Pow => arg(0).powf(arg(1)),
                // Rejected by the compile-time type check.
                Func::Palette | Func::PaletteRgb | Func::Hsv | Func::Rgb => 0.0,
            }
        }
    }
}

/// A compiled, immutable pattern.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    expr: Arc<Expr>,
}

impl CompiledPattern {
    /// Compile a source string. All diagnostics are returned at once where
    /// the parser can recover enough to produce them.
    pub fn compile(source: &str) -> Result<Self, Vec<CompileError>> {
        let tokens = lex(source).map_err(|e| vec![e])?;
        if tokens.is_empty() {
            return Err(vec![CompileError {
                position: 0,
                message: "empty pattern".to_string(),
            }]);
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            source_len: source.len(),
        };
        let expr = parser.parse_expr().map_err(|e| vec![e])?;
        if parser.pos != tokens.len() {
            return Err(vec![CompileError {
                position: parser.position(),
                message: "unexpected trailing input".to_string(),
            }]);
        }
        check_types(&expr).map_err(|e| vec![e])?;
        Ok(Self {
            expr: Arc::new(expr),
        })
    }

    /// Evaluate for one pixel. Pure, no I/O, bounded by the tree size.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<PatternOutput, EvalError> {
        let output = match self.expr.as_ref() {
            Expr::Call(func, args) if func.returns_color() => {
                let arg = |i: usize| eval_num(&args[i], ctx);
                let color = match func {
                    Func::Palette => {
                        let hsv = ctx.palette.sample(arg(0));
                        crate::color::hsv_to_rgb(hsv)
                    }
                    Func::PaletteRgb => ctx.palette.sample_rgb(arg(0)),
                    Func::Hsv => crate::color::hsv_to_rgb(crate::color::Hsv::new(
                        arg(0),
                        arg(1),
                        arg(2),
                    )),
                    Func::Rgb => Rgb::new(arg(0), arg(1), arg(2)).clamped(),
                    _ => unreachable!(),
                };
                PatternOutput::Color(color)
            }
            expr => PatternOutput::PalettePosition(eval_num(expr, ctx)),
        };
        let finite = match output {
            PatternOutput::PalettePosition(p) => p.is_finite(),
            PatternOutput::Color(c) => c.r.is_finite() && c.g.is_finite() && c.b.is_finite(),
        };
        if finite {
            Ok(output)
        } else {
            Err(EvalError {
                message: "pattern produced a non-finite value".to_string(),
            })
        }
    }
}

/// A named pattern: editable source plus the last successfully compiled
/// form and the last compile error, if any.
#[derive(Debug, Clone)]
pub struct PatternDef {
    pub source: String,
    pub compiled: Option<CompiledPattern>,
    pub error: Option<String>,
}

/// Set of named patterns. Recompiling a pattern replaces its compiled form
/// atomically; a failed compile keeps the previous form so running groups
/// fall back to it.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    patterns: HashMap<String, PatternDef>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in pattern sources.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, source) in DEFAULT_PATTERNS {
            registry
                .set_source(name, source)
                .unwrap_or_else(|errors| panic!("builtin pattern '{name}': {:?}", errors));
        }
        registry
    }

    /// Compile `source` and install it under `name`. On failure the previous
    /// compiled form (if any) stays active and the error is recorded.
    pub fn set_source(&mut self, name: &str, source: &str) -> Result<(), Vec<CompileError>> {
        match CompiledPattern::compile(source) {
            Ok(compiled) => {
                self.patterns.insert(
                    name.to_string(),
                    PatternDef {
                        source: source.to_string(),
                        compiled: Some(compiled),
                        error: None,
                    },
                );
                Ok(())
            }
            Err(errors) => {
                let joined = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                match self.patterns.get_mut(name) {
                    Some(def) => {
                        def.source = source.to_string();
                        def.error = Some(joined);
                    }
                    None => {
                        self.patterns.insert(
                            name.to_string(),
                            PatternDef {
                                source: source.to_string(),
                                compiled: None,
                                error: Some(joined),
                            },
                        );
                    }
                }
                Err(errors)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&PatternDef> {
        self.patterns.get(name)
    }

    pub fn compiled(&self, name: &str) -> Option<&CompiledPattern> {
        self.patterns.get(name).and_then(|def| def.compiled.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.patterns.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }
}

/// Built-in pattern sources registered at startup.
pub const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    ("solid", "palette(t)"),
    ("cycle", "palette(t + x)"),
    ("scan", "hsv(t, 1, pulse(x - t, 0.15))"),
    ("plasma", "palette(plasma(x * 4, t))"),
    ("noise", "palette(fbm(x * 3, t * 0.5, 0, 4))"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Hsv;

    fn palette() -> Palette {
        Palette::new(vec![Hsv::new(0.0, 1.0, 1.0), Hsv::new(0.5, 1.0, 1.0)]).unwrap()
    }

    fn ctx(palette: &Palette, t: f32, x: f32) -> EvalContext<'_> {
        EvalContext {
            t,
            x,
            prev: Rgb::BLACK,
            palette,
        }
    }

    #[test]
    fn arithmetic_with_precedence() {
        let palette = palette();
        let pattern = CompiledPattern::compile("1 + 2 * 3 - 4 / 2").unwrap();
        match pattern.eval(&ctx(&palette, 0.0, 0.0)).unwrap() {
            PatternOutput::PalettePosition(p) => assert!((p - 5.0).abs() < 1e-6),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn variables_are_bound() {
        let palette = palette();
        let pattern = CompiledPattern::compile("t * 2 + x").unwrap();
        match pattern.eval(&ctx(&palette, 0.5, 0.25)).unwrap() {
            PatternOutput::PalettePosition(p) => assert!((p - 1.25).abs() < 1e-6),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn color_result_comes_through() {
        let palette = palette();
        let pattern = CompiledPattern::compile("rgb(1, 0.5, 0)").unwrap();
        match pattern.eval(&ctx(&palette, 0.0, 0.0)).unwrap() {
            PatternOutput::Color(c) => {
                assert!((c.r - 1.0).abs() < 1e-6);
                assert!((c.g - 0.5).abs() < 1e-6);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn palette_lookup_uses_group_palette() {
        let palette = palette();
        let pattern = CompiledPattern::compile("palette(0)").unwrap();
        match pattern.eval(&ctx(&palette, 0.0, 0.0)).unwrap() {
            PatternOutput::Color(c) => assert_eq!(c, Rgb::new(1.0, 0.0, 0.0)),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn unknown_names_fail_compile() {
        assert!(CompiledPattern::compile("bogus(1)").is_err());
        assert!(CompiledPattern::compile("y + 1").is_err());
    }

    #[test]
    fn arity_is_checked() {
        let errors = CompiledPattern::compile("pulse(1)").unwrap_err();
        assert!(errors[0].message.contains("2 arguments"));
    }

    #[test]
    fn color_in_numeric_context_fails_compile() {
        assert!(CompiledPattern::compile("rgb(1,0,0) + 1").is_err());
        assert!(CompiledPattern::compile("abs(palette(0))").is_err());
    }

    #[test]
    fn trailing_garbage_fails_compile() {
        let errors = CompiledPattern::compile("1 + 2 )").unwrap_err();
        assert!(errors[0].message.contains("trailing"));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let palette = palette();
        let pattern = CompiledPattern::compile("1 / 0").unwrap();
        assert!(pattern.eval(&ctx(&palette, 0.0, 0.0)).is_err());
    }

    #[test]
    fn prev_color_is_readable() {
        let palette = palette();
        let pattern = CompiledPattern::compile("prev_r + prev_g + prev_b").unwrap();
        let mut context = ctx(&palette, 0.0, 0.0);
        context.prev = Rgb::new(0.25, 0.25, 0.5);
        match pattern.eval(&context).unwrap() {
            PatternOutput::PalettePosition(p) => assert!((p - 1.0).abs() < 1e-6),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn failed_recompile_keeps_last_good_form() {
        let mut registry = PatternRegistry::new();
        registry.set_source("wave", "sine(t)").unwrap();
        assert!(registry.set_source("wave", "sine(").is_err());
        let def = registry.get("wave").unwrap();
        assert!(def.compiled.is_some());
        assert!(def.error.is_some());
        assert_eq!(def.source, "sine(");
    }

    #[test]
    fn builtin_patterns_compile() {
        let registry = PatternRegistry::with_defaults();
        for (name, _) in DEFAULT_PATTERNS {
            assert!(registry.compiled(name).is_some(), "{name} did not compile");
        }
    }
}
