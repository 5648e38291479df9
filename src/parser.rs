//! Parser for the Hunter language
//!
//! Hunter is line-oriented and indentation-sensitive, so there is no token
//! stream: each line is classified by its first word and parsed character by
//! character. Block nesting is tracked with an explicit stack of open block
//! frames keyed by the indentation level that opened them.

use crate::ast::{
    BooleanOp, DataType, DeclarationKind, Expression, ExpressionKind, IntWidth, MathOp, Program,
};
use crate::span::Position;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Parser errors
///
/// Every error is fatal: the parser stops at the first malformed line and the
/// driver reports it and exits.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: malformed statement: {message}")]
    MalformedStatement { line: u32, message: String },

    #[error("line {line}: expected {expected}")]
    Expected { line: u32, expected: String },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: u32 },

    #[error("line {line}: invalid integer literal `{text}`")]
    InvalidInt { line: u32, text: String },

    #[error("line {line}: `else` without a matching `if`")]
    ElseWithoutIf { line: u32 },

    #[error("line {line}: unsupported expression: {message}")]
    UnsupportedExpression { line: u32, message: String },

    #[error("could not read module `{module}`: {message}")]
    ModuleRead { module: String, message: String },
}

/// Parse result
pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a complete source file into a program
pub fn parse(source: &str) -> ParseResult<Program> {
    Parser::new().parse(source)
}

/// An open block on the nesting stack, together with the indentation level of
/// the line that opened it
struct BlockFrame {
    level: usize,
    node: Expression,
}

/// The parser for Hunter source text
pub struct Parser {
    /// Struct names seen so far, so initializers can tell a struct
    /// construction apart from a function call
    struct_names: HashSet<String>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            struct_names: HashSet::new(),
        }
    }

    pub fn parse(&mut self, source: &str) -> ParseResult<Program> {
        let mut top_level: Vec<Expression> = Vec::new();
        let mut stack: Vec<BlockFrame> = Vec::new();

        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = (idx + 1) as u32;

            if raw_line.trim().is_empty() {
                continue;
            }
            if is_comment_line(raw_line) {
                continue;
            }

            let level = raw_line
                .chars()
                .take_while(|c| c.is_whitespace())
                .count();
            let content: Vec<char> = raw_line.chars().skip(level).collect();

            // Close every block this line's indentation steps out of.
            while stack
                .last()
                .map(|frame| level <= frame.level)
                .unwrap_or(false)
            {
                close_frame(&mut stack, &mut top_level, line_no)?;
            }

            let mut cursor = Cursor::new(&content, line_no, level);

            // `else` re-opens the most recently closed `if` instead of
            // becoming a sibling statement.
            if cursor.peek_word().as_deref() == Some("else") {
                cursor.take_word();
                cursor.skip_spaces();
                if !cursor.at_end() {
                    return Err(ParseError::MalformedStatement {
                        line: line_no,
                        message: "unexpected input after `else`".to_string(),
                    });
                }
                let parent = parent_body(&mut stack, &mut top_level);
                match parent.last() {
                    Some(Expression {
                        kind: ExpressionKind::If { else_branch: None, .. },
                        ..
                    }) => {}
                    _ => return Err(ParseError::ElseWithoutIf { line: line_no }),
                }
                stack.push(BlockFrame {
                    level,
                    node: Expression::new(
                        ExpressionKind::Else { body: Vec::new() },
                        Position::new(line_no, level as u32 + 1),
                    ),
                });
                continue;
            }

            // Inside a struct declaration every line is a field.
            if matches!(
                stack.last(),
                Some(BlockFrame {
                    node: Expression {
                        kind: ExpressionKind::Struct { .. },
                        ..
                    },
                    ..
                })
            ) {
                let field = self.parse_struct_field(&mut cursor)?;
                attach(&mut stack, &mut top_level, field);
                continue;
            }

            let statement = self.parse_statement(&mut cursor)?;

            if statement.has_block() {
                if let ExpressionKind::Struct { name, .. } = &statement.kind {
                    self.struct_names.insert(name.clone());
                }
                stack.push(BlockFrame {
                    level,
                    node: statement,
                });
            } else {
                attach(&mut stack, &mut top_level, statement);
            }
        }

        while !stack.is_empty() {
            // Line 0 never appears in source, so this closes everything.
            let line_no = source.lines().count() as u32 + 1;
            close_frame(&mut stack, &mut top_level, line_no)?;
        }

        Ok(Program {
            instructions: top_level,
        })
    }

    /// Dispatch a statement line on its first word
    fn parse_statement(&mut self, cursor: &mut Cursor) -> ParseResult<Expression> {
        let pos = cursor.position();
        let word = cursor.take_word().ok_or_else(|| ParseError::MalformedStatement {
            line: cursor.line,
            message: format!("unexpected character `{}`", cursor.peek().unwrap_or(' ')),
        })?;

        match word.as_str() {
            "import" => {
                cursor.skip_spaces();
                let module = cursor.take_rest().trim().to_string();
                if module.is_empty() {
                    return Err(ParseError::Expected {
                        line: cursor.line,
                        expected: "module path after `import`".to_string(),
                    });
                }
                Ok(Expression::new(ExpressionKind::Import { module }, pos))
            }
            "mod" => {
                cursor.skip_spaces();
                let name = cursor.take_word().ok_or_else(|| ParseError::Expected {
                    line: cursor.line,
                    expected: "module name after `mod`".to_string(),
                })?;
                Ok(Expression::new(ExpressionKind::Module { name }, pos))
            }
            "fun" => self.parse_function_header(cursor, pos, false),
            "extern" => {
                cursor.skip_spaces();
                match cursor.take_word().as_deref() {
                    Some("fun") => {}
                    _ => {
                        return Err(ParseError::Expected {
                            line: cursor.line,
                            expected: "`fun` after `extern`".to_string(),
                        })
                    }
                }
                let header = self.parse_function_header(cursor, pos, true)?;
                Ok(Expression::new(
                    ExpressionKind::Extern {
                        wrapped: Box::new(header),
                    },
                    pos,
                ))
            }
            "struct" => {
                cursor.skip_spaces();
                let name = cursor.take_word().ok_or_else(|| ParseError::Expected {
                    line: cursor.line,
                    expected: "struct name".to_string(),
                })?;
                Ok(Expression::new(
                    ExpressionKind::Struct {
                        name,
                        fields: Vec::new(),
                    },
                    pos,
                ))
            }
            "print" => {
                let call = self.parse_call(cursor, "print".to_string(), pos)?;
                Ok(Expression::new(
                    ExpressionKind::Print {
                        call: Box::new(call),
                    },
                    pos,
                ))
            }
            "const" => self.parse_declaration(cursor, DeclarationKind::Const, pos),
            "let" => self.parse_declaration(cursor, DeclarationKind::Let, pos),
            "if" => {
                let condition = self.parse_condition(cursor, Some("then"))?;
                Ok(Expression::new(
                    ExpressionKind::If {
                        condition: Box::new(condition),
                        body: Vec::new(),
                        else_branch: None,
                    },
                    pos,
                ))
            }
            "while" => {
                let condition = self.parse_condition(cursor, None)?;
                Ok(Expression::new(
                    ExpressionKind::While {
                        condition: Box::new(condition),
                        body: Vec::new(),
                    },
                    pos,
                ))
            }
            "for" => self.parse_for_header(cursor, pos),
            "return" => {
                cursor.skip_spaces();
                let value = self.parse_value(cursor)?;
                Ok(Expression::new(
                    ExpressionKind::FunctionReturn {
                        value: Box::new(value),
                    },
                    pos,
                ))
            }
            name => {
                // Not a keyword: either a call statement or an assignment.
                if cursor.peek() == Some('(') {
                    return self.parse_call(cursor, name.to_string(), pos);
                }
                cursor.skip_spaces();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    cursor.skip_spaces();
                    let value = self.parse_simple_expression(cursor)?;
                    return Ok(Expression::new(
                        ExpressionKind::VariableMutation {
                            name: name.to_string(),
                            value: Box::new(value),
                        },
                        pos,
                    ));
                }
                Err(ParseError::MalformedStatement {
                    line: cursor.line,
                    message: format!("unknown statement starting with `{}`", name),
                })
            }
        }
    }

    /// `name(param: type, …) : returnType` — the part after `fun`
    fn parse_function_header(
        &mut self,
        cursor: &mut Cursor,
        pos: Position,
        is_external: bool,
    ) -> ParseResult<Expression> {
        cursor.skip_spaces();
        let name = cursor.take_word().ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: "function name".to_string(),
        })?;

        cursor.skip_spaces();
        if cursor.peek() != Some('(') {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("`(` after function name `{}`", name),
            });
        }
        cursor.bump();

        let mut params = Vec::new();
        loop {
            cursor.skip_spaces();
            match cursor.peek() {
                Some(')') => {
                    cursor.bump();
                    break;
                }
                Some(_) => {}
                None => {
                    return Err(ParseError::Expected {
                        line: cursor.line,
                        expected: "`)` closing the parameter list".to_string(),
                    })
                }
            }

            let param_pos = cursor.position();
            let param_name = cursor.take_word().ok_or_else(|| ParseError::Expected {
                line: cursor.line,
                expected: "parameter name".to_string(),
            })?;
            cursor.skip_spaces();
            if cursor.peek() != Some(':') {
                return Err(ParseError::Expected {
                    line: cursor.line,
                    expected: format!("`:` after parameter `{}`", param_name),
                });
            }
            cursor.bump();
            cursor.skip_spaces();

            let type_str = cursor.take_until(|c| c == ',' || c == ')');
            let declared_type = DataType::from_str(type_str.trim());
            params.push(Expression::new(
                ExpressionKind::VariableDeclaration {
                    name: param_name,
                    kind: DeclarationKind::Parameter,
                    value: None,
                    declared_type: Some(declared_type),
                },
                param_pos,
            ));

            cursor.skip_spaces();
            if cursor.peek() == Some(',') {
                cursor.bump();
            }
        }

        cursor.skip_spaces();
        let return_type = if cursor.peek() == Some(':') {
            cursor.bump();
            DataType::from_str(cursor.take_rest().trim())
        } else {
            DataType::Void
        };

        Ok(Expression::new(
            ExpressionKind::Function {
                name,
                params,
                return_type,
                is_external,
                body: Vec::new(),
            },
            pos,
        ))
    }

    /// `for i in 1..10` — the part after `for`
    fn parse_for_header(&mut self, cursor: &mut Cursor, pos: Position) -> ParseResult<Expression> {
        cursor.skip_spaces();
        let counter = cursor.take_word().ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: "loop counter name".to_string(),
        })?;

        cursor.skip_spaces();
        if cursor.take_word().as_deref() != Some("in") {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: "`in` after the loop counter".to_string(),
            });
        }

        cursor.skip_spaces();
        let range_pos = cursor.position();
        let start = self.parse_int_token(cursor)?;
        if cursor.peek() != Some('.') || cursor.peek_at(1) != Some('.') {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: "`..` between the range bounds".to_string(),
            });
        }
        cursor.bump();
        cursor.bump();
        let end = self.parse_int_token(cursor)?;

        Ok(Expression::new(
            ExpressionKind::For {
                counter,
                range: Box::new(Expression::new(
                    ExpressionKind::Range {
                        start: start.1,
                        end: end.1,
                    },
                    range_pos,
                )),
                body: Vec::new(),
            },
            pos,
        ))
    }

    /// `const name = value` / `let name = value`
    fn parse_declaration(
        &mut self,
        cursor: &mut Cursor,
        kind: DeclarationKind,
        pos: Position,
    ) -> ParseResult<Expression> {
        cursor.skip_spaces();
        let name = cursor.take_word().ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: "variable name".to_string(),
        })?;

        cursor.skip_spaces();
        if cursor.peek() != Some('=') {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("`=` after variable `{}`", name),
            });
        }
        cursor.bump();
        cursor.skip_spaces();

        let value = self.parse_value(cursor)?;
        Ok(Expression::new(
            ExpressionKind::VariableDeclaration {
                name,
                kind,
                value: Some(Box::new(value)),
                declared_type: None,
            },
            pos,
        ))
    }

    /// `name: type` inside a struct block
    fn parse_struct_field(&mut self, cursor: &mut Cursor) -> ParseResult<Expression> {
        let pos = cursor.position();
        let name = cursor.take_word().ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: "field name".to_string(),
        })?;
        cursor.skip_spaces();
        if cursor.peek() != Some(':') {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("`:` after field `{}`", name),
            });
        }
        cursor.bump();
        let declared_type = DataType::from_str(cursor.take_rest().trim());

        Ok(Expression::new(
            ExpressionKind::VariableDeclaration {
                name,
                kind: DeclarationKind::StructField,
                value: None,
                declared_type: Some(declared_type),
            },
            pos,
        ))
    }

    /// A single value: string, integer, identifier, call or struct construction
    fn parse_value(&mut self, cursor: &mut Cursor) -> ParseResult<Expression> {
        let pos = cursor.position();
        match cursor.peek() {
            Some('"') => {
                let text = self.parse_string(cursor)?;
                Ok(Expression::new(ExpressionKind::Str(text), pos))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let (width, value) = self.parse_int_token(cursor)?;
                Ok(Expression::new(ExpressionKind::Int { width, value }, pos))
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let mut name = cursor.take_word().unwrap();
                if cursor.peek() == Some('(') {
                    if self.struct_names.contains(&name) {
                        let call = self.parse_call(cursor, name.clone(), pos)?;
                        let args = match call.kind {
                            ExpressionKind::FunctionCall { args, .. } => args,
                            _ => unreachable!(),
                        };
                        return Ok(Expression::new(
                            ExpressionKind::StructConstruction {
                                struct_name: name,
                                field_values: args,
                            },
                            pos,
                        ));
                    }
                    return self.parse_call(cursor, name, pos);
                }
                // Dotted struct field access stays a single identifier; the
                // code generator resolves the field offset.
                while cursor.peek() == Some('.')
                    && cursor
                        .peek_at(1)
                        .map(|c| c.is_alphabetic() || c == '_')
                        .unwrap_or(false)
                {
                    cursor.bump();
                    let field = cursor.take_word().unwrap();
                    name.push('.');
                    name.push_str(&field);
                }
                Ok(Expression::new(ExpressionKind::Identifier(name), pos))
            }
            Some(c) => Err(ParseError::MalformedStatement {
                line: cursor.line,
                message: format!("unexpected character `{}`", c),
            }),
            None => Err(ParseError::Expected {
                line: cursor.line,
                expected: "a value".to_string(),
            }),
        }
    }

    /// `(arg, arg, …)` — the cursor sits on the opening parenthesis
    fn parse_call(
        &mut self,
        cursor: &mut Cursor,
        callee: String,
        pos: Position,
    ) -> ParseResult<Expression> {
        if cursor.peek() != Some('(') {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("`(` after `{}`", callee),
            });
        }
        cursor.bump();

        let mut args = Vec::new();
        loop {
            cursor.skip_spaces();
            match cursor.peek() {
                Some(')') => {
                    cursor.bump();
                    break;
                }
                None => {
                    return Err(ParseError::Expected {
                        line: cursor.line,
                        expected: format!("`)` closing the call to `{}`", callee),
                    })
                }
                Some(_) => {}
            }

            args.push(self.parse_value(cursor)?);

            cursor.skip_spaces();
            match cursor.peek() {
                Some(',') => {
                    cursor.bump();
                }
                Some(')') => {}
                _ => {
                    return Err(ParseError::Expected {
                        line: cursor.line,
                        expected: format!("`,` or `)` in the call to `{}`", callee),
                    })
                }
            }
        }

        Ok(Expression::new(
            ExpressionKind::FunctionCall { callee, args },
            pos,
        ))
    }

    /// String literal body; the cursor sits on the opening quote
    fn parse_string(&mut self, cursor: &mut Cursor) -> ParseResult<String> {
        debug_assert_eq!(cursor.peek(), Some('"'));
        cursor.bump();

        let mut text = String::new();
        loop {
            match cursor.bump() {
                Some('"') => return Ok(text),
                Some('\\') => match cursor.bump() {
                    Some('n') => text.push('\n'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some(other) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => return Err(ParseError::UnterminatedString { line: cursor.line }),
                },
                Some(c) => text.push(c),
                None => return Err(ParseError::UnterminatedString { line: cursor.line }),
            }
        }
    }

    /// Decimal integer literal with optional leading minus; selects the
    /// narrowest width that holds the value
    fn parse_int_token(&mut self, cursor: &mut Cursor) -> ParseResult<(IntWidth, i64)> {
        let mut text = String::new();
        if cursor.peek() == Some('-') {
            cursor.bump();
            text.push('-');
        }
        while let Some(c) = cursor.peek() {
            if c.is_ascii_digit() {
                cursor.bump();
                text.push(c);
            } else {
                break;
            }
        }

        let value: i64 = text.parse().map_err(|_| ParseError::InvalidInt {
            line: cursor.line,
            text: text.clone(),
        })?;
        Ok((IntWidth::narrowest(value), value))
    }

    /// Condition with exactly one boolean operator, e.g. `a eq b`, `x < 10`,
    /// `not done`. Stops at `stop_word` (`then` for if-conditions), which must
    /// be present when given.
    fn parse_condition(
        &mut self,
        cursor: &mut Cursor,
        stop_word: Option<&str>,
    ) -> ParseResult<Expression> {
        let pos = cursor.position();
        let mut op: Option<BooleanOp> = None;
        let mut operands: Vec<Expression> = Vec::new();
        let mut reached_stop = false;

        loop {
            cursor.skip_spaces();
            if cursor.at_end() {
                break;
            }

            if let Some(word) = cursor.peek_word() {
                if stop_word == Some(word.as_str()) {
                    cursor.take_word();
                    reached_stop = true;
                    break;
                }
                if let Some(found) = BooleanOp::from_token(&word) {
                    cursor.take_word();
                    if op.replace(found).is_some() {
                        return Err(ParseError::UnsupportedExpression {
                            line: cursor.line,
                            message: "a condition supports a single operator".to_string(),
                        });
                    }
                    continue;
                }
            } else if let Some(found) = cursor.take_symbol_operator(BooleanOp::from_token) {
                if op.replace(found).is_some() {
                    return Err(ParseError::UnsupportedExpression {
                        line: cursor.line,
                        message: "a condition supports a single operator".to_string(),
                    });
                }
                continue;
            }

            operands.push(self.parse_value(cursor)?);
            if operands.len() > 2 {
                return Err(ParseError::UnsupportedExpression {
                    line: cursor.line,
                    message: "a condition supports at most two operands".to_string(),
                });
            }
        }

        if stop_word.is_some() && !reached_stop {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("`{}` after the condition", stop_word.unwrap()),
            });
        }

        let op = op.ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: "an operator in the condition".to_string(),
        })?;

        let mut operands = operands.into_iter();
        let left = operands.next().ok_or_else(|| ParseError::Expected {
            line: cursor.line,
            expected: format!("an operand for `{}`", op),
        })?;
        let right = operands.next();

        if op.operands() == 2 && right.is_none() {
            return Err(ParseError::Expected {
                line: cursor.line,
                expected: format!("a second operand for `{}`", op),
            });
        }
        if op.operands() == 1 && right.is_some() {
            return Err(ParseError::UnsupportedExpression {
                line: cursor.line,
                message: format!("`{}` takes a single operand", op),
            });
        }

        Ok(Expression::new(
            ExpressionKind::Boolean {
                op,
                left: Box::new(left),
                right: right.map(Box::new),
            },
            pos,
        ))
    }

    /// Right-hand side of an assignment: a plain value, or exactly one
    /// arithmetic/bitwise operator between values (`x + 1`). Longer chains
    /// are rejected.
    fn parse_simple_expression(&mut self, cursor: &mut Cursor) -> ParseResult<Expression> {
        let pos = cursor.position();
        let mut op: Option<MathOp> = None;
        let mut operands: Vec<Expression> = Vec::new();

        loop {
            cursor.skip_spaces();
            if cursor.at_end() {
                break;
            }

            // A `-` right after `=` or after the operator starts a negative
            // literal, not a subtraction.
            let minus_is_sign = cursor.peek() == Some('-') && (op.is_some() || operands.is_empty());
            if !minus_is_sign {
                if let Some(found) = cursor.take_symbol_operator(MathOp::from_token) {
                    if op.replace(found).is_some() {
                        return Err(ParseError::UnsupportedExpression {
                            line: cursor.line,
                            message: "an expression supports a single operator".to_string(),
                        });
                    }
                    continue;
                }
            }

            operands.push(self.parse_value(cursor)?);
            if operands.len() > 2 {
                return Err(ParseError::UnsupportedExpression {
                    line: cursor.line,
                    message: "an expression supports at most two operands".to_string(),
                });
            }
        }

        let mut operands = operands.into_iter();
        match op {
            None => operands.next().ok_or_else(|| ParseError::Expected {
                line: cursor.line,
                expected: "a value".to_string(),
            }),
            Some(op) => {
                let left = operands.next();
                let right = operands.next();
                match (op.operands(), &left, &right) {
                    (2, Some(_), Some(_)) | (1, Some(_), None) => Ok(Expression::new(
                        ExpressionKind::Operation {
                            op,
                            left: left.map(Box::new),
                            right: right.map(Box::new),
                        },
                        pos,
                    )),
                    _ => Err(ParseError::Expected {
                        line: cursor.line,
                        expected: format!("operands for `{}`", op),
                    }),
                }
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the line is a comment: a `#` appears outside any string literal
fn is_comment_line(line: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == '#' {
            return true;
        }
    }
    false
}

/// Body list of the innermost open block, or the top level
fn parent_body<'a>(
    stack: &'a mut Vec<BlockFrame>,
    top_level: &'a mut Vec<Expression>,
) -> &'a mut Vec<Expression> {
    match stack.last_mut() {
        Some(frame) => frame
            .node
            .body_mut()
            .expect("block frames always carry a body"),
        None => top_level,
    }
}

/// Append a finished statement to the innermost open block or the top level
fn attach(stack: &mut Vec<BlockFrame>, top_level: &mut Vec<Expression>, expr: Expression) {
    parent_body(stack, top_level).push(expr);
}

/// Pop the innermost frame and attach its finished node. A finished `Else`
/// block attaches to the `if` that closed right before it opened.
fn close_frame(
    stack: &mut Vec<BlockFrame>,
    top_level: &mut Vec<Expression>,
    line_no: u32,
) -> ParseResult<()> {
    let frame = stack.pop().expect("close_frame requires an open frame");

    if let ExpressionKind::Else { .. } = frame.node.kind {
        let parent = parent_body(stack, top_level);
        match parent.last_mut() {
            Some(Expression {
                kind: ExpressionKind::If { else_branch, .. },
                ..
            }) if else_branch.is_none() => {
                *else_branch = Some(Box::new(frame.node));
                Ok(())
            }
            _ => Err(ParseError::ElseWithoutIf { line: line_no }),
        }
    } else {
        attach(stack, top_level, frame.node);
        Ok(())
    }
}

/// Character cursor over a single line's content (indentation stripped)
struct Cursor<'a> {
    chars: &'a [char],
    pos: usize,
    line: u32,
    level: usize,
}

impl<'a> Cursor<'a> {
    fn new(chars: &'a [char], line: u32, level: usize) -> Self {
        Self {
            chars,
            pos: 0,
            line,
            level,
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, (self.level + self.pos + 1) as u32)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_spaces(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    /// Next identifier-shaped word without consuming it
    fn peek_word(&self) -> Option<String> {
        let first = self.peek()?;
        if !(first.is_alphabetic() || first == '_') {
            return None;
        }
        let word: String = self.chars[self.pos..]
            .iter()
            .take_while(|c| c.is_alphanumeric() || **c == '_')
            .collect();
        Some(word)
    }

    /// Consume an identifier-shaped word (alphanumeric + underscore run)
    fn take_word(&mut self) -> Option<String> {
        let word = self.peek_word()?;
        self.pos += word.chars().count();
        Some(word)
    }

    /// Consume characters until `stop` matches (the stop character stays)
    fn take_until(&mut self, stop: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if stop(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }

    /// Consume the rest of the line
    fn take_rest(&mut self) -> String {
        let out: String = self.chars[self.pos..].iter().collect();
        self.pos = self.chars.len();
        out
    }

    /// Consume a symbolic operator (`<=`, `<`, `+`, …) recognized by `table`
    fn take_symbol_operator<T>(&mut self, table: impl Fn(&str) -> Option<T>) -> Option<T> {
        let first = self.peek()?;
        if first.is_alphanumeric() || first == '_' || first == '"' {
            return None;
        }
        // Two-character operators win over their one-character prefix.
        if let Some(second) = self.peek_at(1) {
            let two: String = [first, second].iter().collect();
            if let Some(op) = table(&two) {
                self.pos += 2;
                return Some(op);
            }
        }
        let one = first.to_string();
        if let Some(op) = table(&one) {
            self.pos += 1;
            return Some(op);
        }
        None
    }
}

// ============ Import resolution ============

/// Replace every `import` with the parsed contents of the referenced module
/// file, recursively and at most once per module. Imported instructions are
/// spliced in front of the importing file's instructions, with the module's
/// function names (and the calls between them) prefixed `module.name`.
/// `mod` markers are dropped; the code generator never sees `Import` or
/// `Module` nodes.
pub fn resolve_imports(program: &mut Program, base_dir: &Path) -> ParseResult<()> {
    let mut seen = HashSet::new();
    resolve_imports_inner(program, base_dir, &mut seen)?;
    program
        .instructions
        .retain(|expr| !matches!(expr.kind, ExpressionKind::Module { .. }));
    Ok(())
}

fn resolve_imports_inner(
    program: &mut Program,
    base_dir: &Path,
    seen: &mut HashSet<String>,
) -> ParseResult<()> {
    let mut resolved: Vec<Expression> = Vec::new();

    for expr in std::mem::take(&mut program.instructions) {
        let module = match &expr.kind {
            ExpressionKind::Import { module } => module.clone(),
            _ => {
                resolved.push(expr);
                continue;
            }
        };

        if !seen.insert(module.clone()) {
            continue;
        }

        let file_path = base_dir.join(module.replace('.', "/")).with_extension(crate::FILE_EXTENSION);
        let source = std::fs::read_to_string(&file_path).map_err(|e| ParseError::ModuleRead {
            module: module.clone(),
            message: e.to_string(),
        })?;

        let mut imported = Parser::new().parse(&source)?;
        resolve_imports_inner(&mut imported, base_dir, seen)?;

        // Prefer the module's own `mod` marker for the prefix, fall back to
        // the import path.
        let prefix = imported
            .instructions
            .iter()
            .find_map(|e| match &e.kind {
                ExpressionKind::Module { name } => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_else(|| module.clone());
        imported
            .instructions
            .retain(|e| !matches!(e.kind, ExpressionKind::Module { .. }));

        prefix_module_functions(&mut imported.instructions, &prefix);

        // Imported instructions come first so their declarations precede use.
        resolved.splice(0..0, imported.instructions);
    }

    program.instructions = resolved;
    Ok(())
}

/// Qualify the module's function declarations and the intra-module calls to
/// them with `prefix.`; extern signatures keep their C names.
fn prefix_module_functions(instructions: &mut [Expression], prefix: &str) {
    let mut declared = HashSet::new();
    for expr in instructions.iter() {
        if let ExpressionKind::Function {
            name,
            is_external: false,
            ..
        } = &expr.kind
        {
            declared.insert(name.clone());
        }
    }

    for expr in instructions.iter_mut() {
        rename_functions(expr, prefix, &declared);
    }
}

fn rename_functions(expr: &mut Expression, prefix: &str, declared: &HashSet<String>) {
    match &mut expr.kind {
        ExpressionKind::Function {
            name,
            is_external: false,
            body,
            ..
        } => {
            if declared.contains(name) {
                *name = format!("{}.{}", prefix, name);
            }
            for stmt in body {
                rename_functions(stmt, prefix, declared);
            }
        }
        ExpressionKind::FunctionCall { callee, args } => {
            if declared.contains(callee) {
                *callee = format!("{}.{}", prefix, callee);
            }
            for arg in args {
                rename_functions(arg, prefix, declared);
            }
        }
        ExpressionKind::Print { call } => rename_functions(call, prefix, declared),
        ExpressionKind::VariableDeclaration { value: Some(value), .. } => {
            rename_functions(value, prefix, declared)
        }
        ExpressionKind::VariableMutation { value, .. } => rename_functions(value, prefix, declared),
        ExpressionKind::FunctionReturn { value } => rename_functions(value, prefix, declared),
        ExpressionKind::Boolean { left, right, .. } => {
            rename_functions(left, prefix, declared);
            if let Some(right) = right {
                rename_functions(right, prefix, declared);
            }
        }
        ExpressionKind::Operation { left, right, .. } => {
            if let Some(left) = left {
                rename_functions(left, prefix, declared);
            }
            if let Some(right) = right {
                rename_functions(right, prefix, declared);
            }
        }
        ExpressionKind::If {
            condition,
            body,
            else_branch,
        } => {
            rename_functions(condition, prefix, declared);
            for stmt in body {
                rename_functions(stmt, prefix, declared);
            }
            if let Some(else_branch) = else_branch {
                rename_functions(else_branch, prefix, declared);
            }
        }
        ExpressionKind::Else { body } => {
            for stmt in body {
                rename_functions(stmt, prefix, declared);
            }
        }
        ExpressionKind::While { condition, body } => {
            rename_functions(condition, prefix, declared);
            for stmt in body {
                rename_functions(stmt, prefix, declared);
            }
        }
        ExpressionKind::For { range, body, .. } => {
            rename_functions(range, prefix, declared);
            for stmt in body {
                rename_functions(stmt, prefix, declared);
            }
        }
        ExpressionKind::StructConstruction { field_values, .. } => {
            for value in field_values {
                rename_functions(value, prefix, declared);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        match parse(source) {
            Ok(program) => program,
            Err(err) => panic!("Parse error: {}", err),
        }
    }

    #[test]
    fn test_empty_program() {
        let program = parse_ok("");
        assert!(program.instructions.is_empty());
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        let program = parse_ok("\n# a comment\n   \nconst x = 1\n");
        assert_eq!(program.instructions.len(), 1);
    }

    #[test]
    fn test_simple_function() {
        let program = parse_ok("fun foo()\n  const x = 1\n  print(x)\n");
        assert_eq!(program.instructions.len(), 1);
        if let ExpressionKind::Function {
            name,
            params,
            return_type,
            is_external,
            body,
        } = &program.instructions[0].kind
        {
            assert_eq!(name, "foo");
            assert!(params.is_empty());
            assert_eq!(*return_type, DataType::Void);
            assert!(!is_external);
            assert_eq!(body.len(), 2);
            assert!(matches!(
                body[0].kind,
                ExpressionKind::VariableDeclaration {
                    kind: DeclarationKind::Const,
                    ..
                }
            ));
            if let ExpressionKind::Print { call } = &body[1].kind {
                if let ExpressionKind::FunctionCall { callee, args } = &call.kind {
                    assert_eq!(callee, "print");
                    assert_eq!(args.len(), 1);
                    assert!(matches!(&args[0].kind, ExpressionKind::Identifier(n) if n == "x"));
                } else {
                    panic!("Expected function call inside print");
                }
            } else {
                panic!("Expected print statement");
            }
        } else {
            panic!("Expected function");
        }
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let source = "fun foo(a: i32) : i64\n  if a eq 1 then\n    return 2\n  return 3\nfoo(7)\n";
        let first = parse_ok(source);
        let second = parse_ok(source);
        assert_eq!(first, second);
    }

    #[test]
    fn test_function_with_params_and_return_type() {
        let program = parse_ok("fun add(a: i64, b: i64) : i64\n  return a\n");
        if let ExpressionKind::Function {
            name,
            params,
            return_type,
            ..
        } = &program.instructions[0].kind
        {
            assert_eq!(name, "add");
            assert_eq!(params.len(), 2);
            assert_eq!(*return_type, DataType::Int(IntWidth::W64));
            if let ExpressionKind::VariableDeclaration {
                name,
                kind,
                declared_type,
                value,
            } = &params[0].kind
            {
                assert_eq!(name, "a");
                assert_eq!(*kind, DeclarationKind::Parameter);
                assert_eq!(*declared_type, Some(DataType::Int(IntWidth::W64)));
                assert!(value.is_none());
            } else {
                panic!("Expected parameter declaration");
            }
        } else {
            panic!("Expected function");
        }
    }

    #[test]
    fn test_extern_function() {
        let program = parse_ok("extern fun putchar(c: i32)\n");
        if let ExpressionKind::Extern { wrapped } = &program.instructions[0].kind {
            if let ExpressionKind::Function {
                name,
                is_external,
                body,
                ..
            } = &wrapped.kind
            {
                assert_eq!(name, "putchar");
                assert!(is_external);
                assert!(body.is_empty());
            } else {
                panic!("Expected function inside extern");
            }
        } else {
            panic!("Expected extern");
        }
    }

    #[test]
    fn test_int_width_selection() {
        let program = parse_ok("const a = 1\nconst b = 300\nconst c = 40000\nconst d = 3000000000\nconst e = -128\nconst f = -129\n");
        let widths: Vec<IntWidth> = program
            .instructions
            .iter()
            .map(|expr| match &expr.kind {
                ExpressionKind::VariableDeclaration {
                    value: Some(value), ..
                } => match value.kind {
                    ExpressionKind::Int { width, .. } => width,
                    _ => panic!("Expected int initializer"),
                },
                _ => panic!("Expected declaration"),
            })
            .collect();
        assert_eq!(
            widths,
            vec![
                IntWidth::W8,
                IntWidth::W16,
                IntWidth::W32,
                IntWidth::W64,
                IntWidth::W8,
                IntWidth::W16,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let program = parse_ok("const s = \"line\\n\\\"quoted\\\"\"\n");
        if let ExpressionKind::VariableDeclaration {
            value: Some(value), ..
        } = &program.instructions[0].kind
        {
            assert_eq!(value.kind, ExpressionKind::Str("line\n\"quoted\"".to_string()));
        } else {
            panic!("Expected declaration");
        }
    }

    #[test]
    fn test_block_nesting() {
        let program = parse_ok("fun foo()\n  const x = 1\n  print(x)\n");
        assert_eq!(program.instructions.len(), 1);
        if let ExpressionKind::Function { body, .. } = &program.instructions[0].kind {
            assert_eq!(body.len(), 2);
        } else {
            panic!("Expected function");
        }
    }

    #[test]
    fn test_sibling_after_block() {
        let program = parse_ok("fun foo()\n  print(\"hi\")\nconst x = 1\n");
        assert_eq!(program.instructions.len(), 2);
        assert!(matches!(
            program.instructions[0].kind,
            ExpressionKind::Function { .. }
        ));
        assert!(matches!(
            program.instructions[1].kind,
            ExpressionKind::VariableDeclaration { .. }
        ));
    }

    #[test]
    fn test_if_else_split() {
        let program =
            parse_ok("if a eq b then\n  print(\"same\")\nelse\n  print(\"different\")\n");
        assert_eq!(program.instructions.len(), 1);
        if let ExpressionKind::If {
            condition,
            body,
            else_branch,
        } = &program.instructions[0].kind
        {
            assert!(matches!(
                condition.kind,
                ExpressionKind::Boolean {
                    op: BooleanOp::Equals,
                    ..
                }
            ));
            assert_eq!(body.len(), 1);
            let else_branch = else_branch.as_ref().expect("else branch attached");
            if let ExpressionKind::Else { body } = &else_branch.kind {
                assert_eq!(body.len(), 1);
            } else {
                panic!("Expected else block");
            }
        } else {
            panic!("Expected if");
        }
    }

    #[test]
    fn test_nested_if_else_inside_function() {
        let program = parse_ok(
            "fun check(a: i64)\n  if a eq 1 then\n    print(\"one\")\n  else\n    print(\"other\")\n  print(\"done\")\n",
        );
        if let ExpressionKind::Function { body, .. } = &program.instructions[0].kind {
            assert_eq!(body.len(), 2);
            if let ExpressionKind::If { else_branch, .. } = &body[0].kind {
                assert!(else_branch.is_some());
            } else {
                panic!("Expected if as first statement");
            }
            assert!(matches!(body[1].kind, ExpressionKind::Print { .. }));
        } else {
            panic!("Expected function");
        }
    }

    #[test]
    fn test_else_without_if_rejected() {
        assert!(matches!(
            parse("else\n  print(\"x\")\n"),
            Err(ParseError::ElseWithoutIf { .. })
        ));
    }

    #[test]
    fn test_missing_then_rejected() {
        assert!(matches!(
            parse("if a eq b\n  print(\"x\")\n"),
            Err(ParseError::Expected { .. })
        ));
    }

    #[test]
    fn test_while_loop() {
        let program = parse_ok("while x < 10\n  x = x + 1\n");
        if let ExpressionKind::While { condition, body } = &program.instructions[0].kind {
            assert!(matches!(
                condition.kind,
                ExpressionKind::Boolean {
                    op: BooleanOp::Lower,
                    ..
                }
            ));
            assert_eq!(body.len(), 1);
        } else {
            panic!("Expected while");
        }
    }

    #[test]
    fn test_for_loop_range() {
        let program = parse_ok("for i in 1..10\n  print(i)\n");
        if let ExpressionKind::For {
            counter,
            range,
            body,
        } = &program.instructions[0].kind
        {
            assert_eq!(counter, "i");
            assert_eq!(
                range.kind,
                ExpressionKind::Range { start: 1, end: 10 }
            );
            assert_eq!(body.len(), 1);
        } else {
            panic!("Expected for");
        }
    }

    #[test]
    fn test_mutation_single_operator() {
        let program = parse_ok("foo = foo + 1\n");
        if let ExpressionKind::VariableMutation { name, value } = &program.instructions[0].kind {
            assert_eq!(name, "foo");
            if let ExpressionKind::Operation { op, left, right } = &value.kind {
                assert_eq!(*op, MathOp::Add);
                assert!(matches!(
                    left.as_ref().unwrap().kind,
                    ExpressionKind::Identifier(ref n) if n == "foo"
                ));
                assert_eq!(
                    right.as_ref().unwrap().kind,
                    ExpressionKind::Int {
                        width: IntWidth::W8,
                        value: 1
                    }
                );
            } else {
                panic!("Expected operation");
            }
        } else {
            panic!("Expected mutation");
        }
    }

    #[test]
    fn test_chained_operators_rejected() {
        assert!(matches!(
            parse("foo = foo + 1 + 2\n"),
            Err(ParseError::UnsupportedExpression { .. })
        ));
        assert!(matches!(
            parse("if a eq b eq c then\n  print(\"x\")\n"),
            Err(ParseError::UnsupportedExpression { .. })
        ));
    }

    #[test]
    fn test_negative_literal_in_assignment() {
        let program = parse_ok("x = -5\n");
        if let ExpressionKind::VariableMutation { value, .. } = &program.instructions[0].kind {
            assert_eq!(
                value.kind,
                ExpressionKind::Int {
                    width: IntWidth::W8,
                    value: -5
                }
            );
        } else {
            panic!("Expected mutation");
        }
    }

    #[test]
    fn test_struct_declaration_and_construction() {
        let program = parse_ok(
            "struct Point\n  x: i32\n  y: i32\nconst origin = Point(0, 0)\nprint(origin.x)\n",
        );
        assert_eq!(program.instructions.len(), 3);
        if let ExpressionKind::Struct { name, fields } = &program.instructions[0].kind {
            assert_eq!(name, "Point");
            assert_eq!(fields.len(), 2);
            assert!(matches!(
                fields[0].kind,
                ExpressionKind::VariableDeclaration {
                    kind: DeclarationKind::StructField,
                    ..
                }
            ));
        } else {
            panic!("Expected struct");
        }
        if let ExpressionKind::VariableDeclaration {
            value: Some(value), ..
        } = &program.instructions[1].kind
        {
            if let ExpressionKind::StructConstruction {
                struct_name,
                field_values,
            } = &value.kind
            {
                assert_eq!(struct_name, "Point");
                assert_eq!(field_values.len(), 2);
            } else {
                panic!("Expected struct construction");
            }
        } else {
            panic!("Expected declaration");
        }
        if let ExpressionKind::Print { call } = &program.instructions[2].kind {
            if let ExpressionKind::FunctionCall { args, .. } = &call.kind {
                assert!(matches!(
                    &args[0].kind,
                    ExpressionKind::Identifier(n) if n == "origin.x"
                ));
            } else {
                panic!("Expected call");
            }
        } else {
            panic!("Expected print");
        }
    }

    #[test]
    fn test_call_statement_and_nested_call_argument() {
        let program = parse_ok("foo(1, bar(2), \"x\")\n");
        if let ExpressionKind::FunctionCall { callee, args } = &program.instructions[0].kind {
            assert_eq!(callee, "foo");
            assert_eq!(args.len(), 3);
            assert!(matches!(
                &args[1].kind,
                ExpressionKind::FunctionCall { callee, .. } if callee == "bar"
            ));
            assert!(matches!(&args[2].kind, ExpressionKind::Str(s) if s == "x"));
        } else {
            panic!("Expected call");
        }
    }

    #[test]
    fn test_import_and_module_markers() {
        let program = parse_ok("mod geometry\nimport math.vector\n");
        assert!(matches!(
            &program.instructions[0].kind,
            ExpressionKind::Module { name } if name == "geometry"
        ));
        assert!(matches!(
            &program.instructions[1].kind,
            ExpressionKind::Import { module } if module == "math.vector"
        ));
    }

    #[test]
    fn test_return_statement() {
        let program = parse_ok("fun one() : i8\n  return 1\n");
        if let ExpressionKind::Function { body, .. } = &program.instructions[0].kind {
            assert!(matches!(body[0].kind, ExpressionKind::FunctionReturn { .. }));
        } else {
            panic!("Expected function");
        }
    }

    #[test]
    fn test_unknown_statement_rejected() {
        assert!(matches!(
            parse("foo bar\n"),
            Err(ParseError::MalformedStatement { .. })
        ));
    }

    #[test]
    fn test_not_condition() {
        let program = parse_ok("while not done\n  done = done + 1\n");
        if let ExpressionKind::While { condition, .. } = &program.instructions[0].kind {
            if let ExpressionKind::Boolean { op, left, right } = &condition.kind {
                assert_eq!(*op, BooleanOp::Not);
                assert!(matches!(&left.kind, ExpressionKind::Identifier(n) if n == "done"));
                assert!(right.is_none());
            } else {
                panic!("Expected boolean condition");
            }
        } else {
            panic!("Expected while");
        }
    }
}
