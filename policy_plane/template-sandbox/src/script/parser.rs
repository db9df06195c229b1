// Parser for rule scripts.
//
// A small JavaScript-like statement language: let/const/var, assignment
// (including += -= *= /= ++ --), if/else, while, for, for-of, return,
// break, continue, throw and expression statements. Expressions cover
// literals, array/object literals, member/index access, calls, unary
// `! - typeof`, the usual binary operators and `?:`.
//
// Binary chains, unary prefixes and postfix chains are parsed iteratively
// and each is capped while it is being folded. Bracket nesting is bounded
// before parsing and tree depth after it, so hostile input cannot exhaust
// the worker stack.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, one_of, satisfy},
    combinator::{all_consuming, map, not, opt, recognize, value},
    error::{convert_error, ErrorKind, ParseError as NomParseError, VerboseError, VerboseErrorKind},
    multi::{many0, many_m_n, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::Value;

use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use super::value::number;
use crate::error::SandboxError;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

const KEYWORDS: &[&str] = &[
    "let", "const", "var", "if", "else", "while", "for", "of", "return", "break", "continue",
    "throw", "true", "false", "null", "undefined", "typeof", "function", "new",
];

/// Bracket depth accepted before parsing
const MAX_BRACKET_DEPTH: usize = 64;
/// Right-recursive constructs (`?:`, `else`) accepted before parsing
const MAX_CHAINED_BRANCHES: usize = 256;
/// Syntax tree depth accepted after parsing
const MAX_TREE_DEPTH: usize = 256;

// ============================================================================
// Public API
// ============================================================================

pub fn parse_program(source: &str) -> Result<Program, SandboxError> {
    check_nesting(source)?;

    let program = match all_consuming(terminated(many0(statement), sp))(source) {
        Ok((_, program)) => program,
        Err(nom::Err::Failure(e)) if is_too_deep(&e) => {
            return Err(SandboxError::Module(
                "script nesting exceeds the supported depth".to_string(),
            ))
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(SandboxError::Module(format!(
                "syntax error: {}",
                convert_error(source, e)
            )))
        }
        Err(nom::Err::Incomplete(_)) => {
            return Err(SandboxError::Module("incomplete input".to_string()))
        }
    };

    if program.iter().any(|s| stmt_exceeds(s, 0)) {
        return Err(SandboxError::Module(
            "script nesting exceeds the supported depth".to_string(),
        ));
    }
    Ok(program)
}

fn check_nesting(source: &str) -> Result<(), SandboxError> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut branches = 0usize;
    let mut idx = 0usize;

    while idx < bytes.len() {
        match bytes[idx] {
            b'/' if bytes.get(idx + 1) == Some(&b'/') => {
                while idx < bytes.len() && bytes[idx] != b'\n' {
                    idx += 1;
                }
            }
            q @ (b'"' | b'\'') => {
                idx += 1;
                while idx < bytes.len() && bytes[idx] != q && bytes[idx] != b'\n' {
                    if bytes[idx] == b'\\' {
                        idx += 1;
                    }
                    idx += 1;
                }
            }
            b'(' | b'[' | b'{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'?' => branches += 1,
            _ => {}
        }
        idx += 1;
    }
    branches += source.matches("else").count();

    if max_depth > MAX_BRACKET_DEPTH || branches > MAX_CHAINED_BRANCHES {
        return Err(SandboxError::Module(
            "script nesting exceeds the supported depth".to_string(),
        ));
    }
    Ok(())
}

fn is_too_deep(e: &VerboseError<&str>) -> bool {
    e.errors
        .iter()
        .any(|(_, kind)| matches!(kind, VerboseErrorKind::Nom(ErrorKind::TooLarge)))
}

/// Abort a chain whose fold would exceed the tree depth
fn too_deep<T>(i: &str) -> PResult<'_, T> {
    Err(nom::Err::Failure(VerboseError::from_error_kind(i, ErrorKind::TooLarge)))
}

fn stmt_exceeds(stmt: &Stmt, depth: usize) -> bool {
    if depth > MAX_TREE_DEPTH {
        return true;
    }
    let next = depth + 1;
    let any = |stmts: &[Stmt]| stmts.iter().any(|s| stmt_exceeds(s, next));
    match stmt {
        Stmt::Let(_, e) | Stmt::Expr(e) | Stmt::Throw(e) | Stmt::Return(Some(e)) => {
            expr_exceeds(e, next)
        }
        Stmt::Assign(t, e) | Stmt::CompoundAssign(_, t, e) => {
            expr_exceeds(t, next) || expr_exceeds(e, next)
        }
        Stmt::If(c, then, otherwise) => {
            expr_exceeds(c, next) || any(then) || otherwise.as_deref().map(any).unwrap_or(false)
        }
        Stmt::While(c, body) | Stmt::ForOf(_, c, body) => expr_exceeds(c, next) || any(body),
        Stmt::For { init, cond, update, body } => {
            init.as_deref().map(|s| stmt_exceeds(s, next)).unwrap_or(false)
                || cond.as_ref().map(|c| expr_exceeds(c, next)).unwrap_or(false)
                || update.as_deref().map(|s| stmt_exceeds(s, next)).unwrap_or(false)
                || any(body)
        }
        Stmt::Block(body) => any(body),
        Stmt::Return(None) | Stmt::Break | Stmt::Continue | Stmt::Empty => false,
    }
}

fn expr_exceeds(expr: &Expr, depth: usize) -> bool {
    if depth > MAX_TREE_DEPTH {
        return true;
    }
    let next = depth + 1;
    match expr {
        Expr::Literal(_) | Expr::Ident(_) => false,
        Expr::Array(items) => items.iter().any(|e| expr_exceeds(e, next)),
        Expr::Object(props) => props.iter().any(|(_, e)| expr_exceeds(e, next)),
        Expr::Unary(_, e) | Expr::Member(e, _) => expr_exceeds(e, next),
        Expr::Binary(_, l, r) | Expr::Index(l, r) => {
            expr_exceeds(l, next) || expr_exceeds(r, next)
        }
        Expr::Conditional(c, a, b) => {
            expr_exceeds(c, next) || expr_exceeds(a, next) || expr_exceeds(b, next)
        }
        Expr::Call(callee, args) => {
            expr_exceeds(callee, next) || args.iter().any(|e| expr_exceeds(e, next))
        }
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

/// Skip whitespace and comments
fn sp(input: &str) -> PResult<'_, ()> {
    let mut i = input;
    loop {
        let t = i.trim_start();
        if let Some(rest) = t.strip_prefix("//") {
            i = match rest.find('\n') {
                Some(p) => &rest[p..],
                None => &rest[rest.len()..],
            };
        } else if let Some(rest) = t.strip_prefix("/*") {
            match rest.find("*/") {
                Some(p) => i = &rest[p + 2..],
                None => {
                    return Err(nom::Err::Failure(VerboseError::from_error_kind(
                        t,
                        ErrorKind::TakeUntil,
                    )))
                }
            }
        } else {
            return Ok((t, ()));
        }
    }
}

fn tok<'a>(t: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(sp, tag(t))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(sp, terminated(tag(kw), not(satisfy(is_ident_char))))
}

fn raw_ident(i: &str) -> PResult<'_, &str> {
    preceded(
        sp,
        recognize(pair(satisfy(is_ident_start), take_while(is_ident_char))),
    )(i)
}

fn identifier(i: &str) -> PResult<'_, String> {
    let (rest, name) = raw_ident(i)?;
    if KEYWORDS.contains(&name) {
        return Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Tag)));
    }
    Ok((rest, name.to_string()))
}

fn number_lit(i: &str) -> PResult<'_, Expr> {
    let (rest, text) = preceded(
        sp,
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
    )(i)?;
    match text.parse::<f64>() {
        Ok(n) => Ok((rest, Expr::Literal(number(n)))),
        Err(_) => Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Float))),
    }
}

fn string_lit(i: &str) -> PResult<'_, String> {
    let (i, _) = sp(i)?;
    let (mut rest, quote) = one_of::<_, _, VerboseError<&str>>("\"'")(i)?;
    let mut out = String::new();

    loop {
        let mut chars = rest.chars();
        match chars.next() {
            Some(c) if c == quote => return Ok((&rest[1..], out)),
            Some('\\') => {
                let esc = match chars.next() {
                    Some(e) => e,
                    None => {
                        return Err(nom::Err::Failure(VerboseError::from_error_kind(
                            rest,
                            ErrorKind::Escaped,
                        )))
                    }
                };
                out.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
                rest = &rest[1 + esc.len_utf8()..];
            }
            Some('\n') | None => {
                return Err(nom::Err::Failure(VerboseError::from_error_kind(
                    rest,
                    ErrorKind::Char,
                )))
            }
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

fn expr(i: &str) -> PResult<'_, Expr> {
    let (i, cond) = or_expr(i)?;
    match tok("?")(i) {
        Ok((rest, _)) => {
            let (rest, then) = expr(rest)?;
            let (rest, _) = tok(":")(rest)?;
            let (rest, otherwise) = expr(rest)?;
            Ok((
                rest,
                Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise)),
            ))
        }
        Err(nom::Err::Error(_)) => Ok((i, cond)),
        Err(e) => Err(e),
    }
}

fn binary_level<'a>(
    i: &'a str,
    operand: fn(&'a str) -> PResult<'a, Expr>,
    op: fn(&'a str) -> PResult<'a, BinaryOp>,
) -> PResult<'a, Expr> {
    let (mut i, mut lhs) = operand(i)?;
    let mut length = 0usize;
    loop {
        match op(i) {
            Ok((rest, o)) => {
                length += 1;
                if length > MAX_TREE_DEPTH {
                    return too_deep(rest);
                }
                let (rest, rhs) = operand(rest)?;
                lhs = Expr::Binary(o, Box::new(lhs), Box::new(rhs));
                i = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((i, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn or_expr(i: &str) -> PResult<'_, Expr> {
    binary_level(i, and_expr, or_op)
}

fn and_expr(i: &str) -> PResult<'_, Expr> {
    binary_level(i, equality, and_op)
}

fn equality(i: &str) -> PResult<'_, Expr> {
    binary_level(i, comparison, eq_op)
}

fn comparison(i: &str) -> PResult<'_, Expr> {
    binary_level(i, additive, cmp_op)
}

fn additive(i: &str) -> PResult<'_, Expr> {
    binary_level(i, multiplicative, add_op)
}

fn multiplicative(i: &str) -> PResult<'_, Expr> {
    binary_level(i, unary, mul_op)
}

fn or_op(i: &str) -> PResult<'_, BinaryOp> {
    value(BinaryOp::Or, tok("||"))(i)
}

fn and_op(i: &str) -> PResult<'_, BinaryOp> {
    value(BinaryOp::And, tok("&&"))(i)
}

fn eq_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        alt((
            value(BinaryOp::Eq, tag("===")),
            value(BinaryOp::NotEq, tag("!==")),
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::NotEq, tag("!=")),
        )),
    )(i)
}

fn cmp_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        alt((
            value(BinaryOp::LtEq, tag("<=")),
            value(BinaryOp::GtEq, tag(">=")),
            value(BinaryOp::Lt, char('<')),
            value(BinaryOp::Gt, char('>')),
        )),
    )(i)
}

fn add_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        alt((
            value(BinaryOp::Add, terminated(char('+'), not(one_of("+=")))),
            value(BinaryOp::Sub, terminated(char('-'), not(one_of("-=")))),
        )),
    )(i)
}

fn mul_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        terminated(
            alt((
                value(BinaryOp::Mul, char('*')),
                value(BinaryOp::Div, char('/')),
                value(BinaryOp::Rem, char('%')),
            )),
            not(char('=')),
        ),
    )(i)
}

fn unary(i: &str) -> PResult<'_, Expr> {
    let (i, ops) = many_m_n(
        0,
        MAX_TREE_DEPTH + 1,
        alt((
            value(UnaryOp::Not, terminated(tok("!"), not(char('=')))),
            value(UnaryOp::Neg, terminated(tok("-"), not(one_of("-=")))),
            value(UnaryOp::TypeOf, keyword("typeof")),
        )),
    )(i)?;
    if ops.len() > MAX_TREE_DEPTH {
        return too_deep(i);
    }
    let (i, operand) = postfix(i)?;
    Ok((
        i,
        ops.into_iter()
            .rev()
            .fold(operand, |acc, op| Expr::Unary(op, Box::new(acc))),
    ))
}

enum Postfix {
    Member(String),
    Index(Expr),
    Call(Vec<Expr>),
}

fn arguments(i: &str) -> PResult<'_, Vec<Expr>> {
    delimited(
        tok("("),
        terminated(separated_list0(tok(","), expr), opt(tok(","))),
        tok(")"),
    )(i)
}

fn postfix(i: &str) -> PResult<'_, Expr> {
    let (i, base) = primary(i)?;
    let (i, ops) = many_m_n(
        0,
        MAX_TREE_DEPTH + 1,
        alt((
            map(preceded(tok("."), raw_ident), |n| Postfix::Member(n.to_string())),
            map(delimited(tok("["), expr, tok("]")), Postfix::Index),
            map(arguments, Postfix::Call),
        )),
    )(i)?;
    if ops.len() > MAX_TREE_DEPTH {
        return too_deep(i);
    }

    let folded = ops.into_iter().fold(base, |acc, op| match op {
        Postfix::Member(name) => Expr::Member(Box::new(acc), name),
        Postfix::Index(idx) => Expr::Index(Box::new(acc), Box::new(idx)),
        Postfix::Call(args) => Expr::Call(Box::new(acc), args),
    });
    Ok((i, folded))
}

fn array_lit(i: &str) -> PResult<'_, Expr> {
    map(
        delimited(
            tok("["),
            terminated(separated_list0(tok(","), expr), opt(tok(","))),
            tok("]"),
        ),
        Expr::Array,
    )(i)
}

fn property(i: &str) -> PResult<'_, (String, Expr)> {
    let (i, key) = alt((string_lit, map(raw_ident, str::to_string)))(i)?;
    let (i, val) = preceded(tok(":"), expr)(i)?;
    Ok((i, (key, val)))
}

fn object_lit(i: &str) -> PResult<'_, Expr> {
    map(
        delimited(
            tok("{"),
            terminated(separated_list0(tok(","), property), opt(tok(","))),
            tok("}"),
        ),
        Expr::Object,
    )(i)
}

fn primary(i: &str) -> PResult<'_, Expr> {
    alt((
        number_lit,
        map(string_lit, |s| Expr::Literal(Value::String(s))),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        value(Expr::Literal(Value::Null), keyword("undefined")),
        array_lit,
        object_lit,
        delimited(tok("("), expr, tok(")")),
        map(identifier, Expr::Ident),
    ))(i)
}

// ============================================================================
// Statements
// ============================================================================

fn statement(i: &str) -> PResult<'_, Stmt> {
    alt((
        terminated(let_head, opt(tok(";"))),
        if_stmt,
        while_stmt,
        for_stmt,
        return_stmt,
        value(Stmt::Break, terminated(keyword("break"), opt(tok(";")))),
        value(Stmt::Continue, terminated(keyword("continue"), opt(tok(";")))),
        throw_stmt,
        map(block, Stmt::Block),
        value(Stmt::Empty, tok(";")),
        terminated(simple_stmt, opt(tok(";"))),
    ))(i)
}

fn declarator(i: &str) -> PResult<'_, &str> {
    alt((keyword("let"), keyword("const"), keyword("var")))(i)
}

fn assign_eq(i: &str) -> PResult<'_, &str> {
    terminated(tok("="), not(char('=')))(i)
}

fn let_head(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = declarator(i)?;
    let (i, name) = identifier(i)?;
    let (i, init) = opt(preceded(assign_eq, expr))(i)?;
    Ok((i, Stmt::Let(name, init.unwrap_or(Expr::Literal(Value::Null)))))
}

fn compound_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        alt((
            value(BinaryOp::Add, tag("+=")),
            value(BinaryOp::Sub, tag("-=")),
            value(BinaryOp::Mul, tag("*=")),
            value(BinaryOp::Div, tag("/=")),
        )),
    )(i)
}

fn step_op(i: &str) -> PResult<'_, BinaryOp> {
    preceded(
        sp,
        alt((value(BinaryOp::Add, tag("++")), value(BinaryOp::Sub, tag("--")))),
    )(i)
}

/// Assignment or expression statement, without the trailing semicolon
fn simple_stmt(i: &str) -> PResult<'_, Stmt> {
    let (rest, target) = expr(i)?;
    if target.is_place() {
        if let Ok((rest, _)) = assign_eq(rest) {
            let (rest, rhs) = expr(rest)?;
            return Ok((rest, Stmt::Assign(target, rhs)));
        }
        if let Ok((rest, op)) = compound_op(rest) {
            let (rest, rhs) = expr(rest)?;
            return Ok((rest, Stmt::CompoundAssign(op, target, rhs)));
        }
        if let Ok((rest, op)) = step_op(rest) {
            return Ok((
                rest,
                Stmt::CompoundAssign(op, target, Expr::Literal(Value::from(1))),
            ));
        }
    }
    Ok((rest, Stmt::Expr(target)))
}

fn block(i: &str) -> PResult<'_, Vec<Stmt>> {
    delimited(tok("{"), many0(statement), tok("}"))(i)
}

fn body(i: &str) -> PResult<'_, Vec<Stmt>> {
    alt((block, map(statement, |s| vec![s])))(i)
}

fn condition(i: &str) -> PResult<'_, Expr> {
    delimited(tok("("), expr, tok(")"))(i)
}

fn if_stmt(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = keyword("if")(i)?;
    let (i, cond) = condition(i)?;
    let (i, then) = body(i)?;
    let (i, otherwise) = opt(preceded(keyword("else"), body))(i)?;
    Ok((i, Stmt::If(cond, then, otherwise)))
}

fn while_stmt(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = keyword("while")(i)?;
    let (i, cond) = condition(i)?;
    let (i, body) = body(i)?;
    Ok((i, Stmt::While(cond, body)))
}

fn for_of_head(i: &str) -> PResult<'_, (String, Expr)> {
    let (i, _) = declarator(i)?;
    let (i, name) = identifier(i)?;
    let (i, _) = keyword("of")(i)?;
    let (i, iterable) = expr(i)?;
    Ok((i, (name, iterable)))
}

fn for_stmt(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = keyword("for")(i)?;
    let (i, _) = tok("(")(i)?;

    if let Ok((rest, (name, iterable))) = for_of_head(i) {
        let (rest, _) = tok(")")(rest)?;
        let (rest, body) = body(rest)?;
        return Ok((rest, Stmt::ForOf(name, iterable, body)));
    }

    let (i, init) = opt(alt((let_head, simple_stmt)))(i)?;
    let (i, _) = tok(";")(i)?;
    let (i, cond) = opt(expr)(i)?;
    let (i, _) = tok(";")(i)?;
    let (i, update) = opt(simple_stmt)(i)?;
    let (i, _) = tok(")")(i)?;
    let (i, body) = body(i)?;
    Ok((
        i,
        Stmt::For {
            init: init.map(Box::new),
            cond,
            update: update.map(Box::new),
            body,
        },
    ))
}

fn return_stmt(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = keyword("return")(i)?;
    let (i, value) = opt(expr)(i)?;
    let (i, _) = opt(tok(";"))(i)?;
    Ok((i, Stmt::Return(value)))
}

fn throw_stmt(i: &str) -> PResult<'_, Stmt> {
    let (i, _) = keyword("throw")(i)?;
    let (i, value) = expr(i)?;
    let (i, _) = opt(tok(";"))(i)?;
    Ok((i, Stmt::Throw(value)))
}
