//! Evaluator for `.if`/`.elif` expressions.
//!
//! ```text
//! or    := and ('||' and)*
//! and   := cmp ('&&' cmp)*
//! cmp   := unary (('=='|'!='|'<'|'<='|'>'|'>=') unary)?
//! unary := '!' unary | atom
//! atom  := '"' text '"' | 'defined(' NAME ')' | 'target(' NAME ')'
//! ```

use std::cmp::Ordering;

use crate::error::Error;
use crate::expand::{Cursor, Expander};
use crate::scope::{ScopeId, ScopeTree};

/// Evaluate `text` in `scope`.
///
/// # Errors
///
/// Returns `Error::InvalidExpression` for malformed input, including
/// trailing text after a complete expression, and expansion errors from
/// quoted atoms.
pub fn evaluate(expander: &Expander<'_>, tree: &ScopeTree, scope: ScopeId, text: &str) -> Result<bool, Error> {
    let mut eval = Evaluator {
        cursor: Cursor::new(text),
        expander,
        scope,
        tree,
    };
    let value = eval.or()?;
    eval.cursor.skip_whitespace();
    if eval.cursor.peek().is_some() {
        return Err(eval.invalid());
    }
    return Ok(value);
}

/// Recursive-descent state over one expression.
struct Evaluator<'e, 't> {
    /// Position in the expression text.
    cursor: Cursor<'t>,
    /// Expands `${...}` inside quoted atoms.
    expander: &'e Expander<'e>,
    /// Scope searched by `defined()` and `target()`.
    scope: ScopeId,
    /// Tree holding `scope`.
    tree: &'e ScopeTree,
}

impl Evaluator<'_, '_> {
    /// `and ('||' and)*`
    fn or(&mut self) -> Result<bool, Error> {
        let mut value = self.and()?;
        loop {
            self.cursor.skip_whitespace();
            if !self.cursor.eat("||") {
                return Ok(value);
            }
            value |= self.and()?;
        }
    }

    /// `cmp ('&&' cmp)*`
    fn and(&mut self) -> Result<bool, Error> {
        let mut value = self.comparison()?;
        loop {
            self.cursor.skip_whitespace();
            if !self.cursor.eat("&&") {
                return Ok(value);
            }
            value &= self.comparison()?;
        }
    }

    /// One optional comparison; a lone operand is tested for truth.
    fn comparison(&mut self) -> Result<bool, Error> {
        let left = self.unary()?;
        self.cursor.skip_whitespace();

        let op = if self.cursor.eat("==") {
            Op::Eq
        } else if self.cursor.eat("!=") {
            Op::Ne
        } else if self.cursor.eat("<=") {
            Op::Le
        } else if self.cursor.eat("<") {
            Op::Lt
        } else if self.cursor.eat(">=") {
            Op::Ge
        } else if self.cursor.eat(">") {
            Op::Gt
        } else {
            return Ok(is_truthy(left.trim()));
        };

        let right = self.unary()?;
        let ordering = compare(left.trim(), right.trim());
        return Ok(match op {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
        });
    }

    /// Leading `!` negations. `!=` is left for the comparison.
    fn unary(&mut self) -> Result<String, Error> {
        self.cursor.skip_whitespace();
        if self.cursor.peek() == Some('!') && !self.cursor.rest().starts_with("!=") {
            self.cursor.bump();
            let inner = self.unary()?;
            let negated = if is_truthy(inner.trim()) { "0" } else { "1" };
            return Ok(negated.to_string());
        }
        return self.atom();
    }

    /// Quoted text, `defined(NAME)` or `target(NAME)`.
    fn atom(&mut self) -> Result<String, Error> {
        self.cursor.skip_whitespace();
        if self.cursor.eat("\"") {
            return self.quoted();
        }
        if self.cursor.eat("defined") {
            let name = self.call_argument()?;
            let found = self.tree.find_macro(self.scope, &name).is_some();
            return Ok(flag(found));
        }
        if self.cursor.eat("target") {
            let name = self.call_argument()?;
            let found = self.tree.find_file(self.scope, &name).is_some();
            return Ok(flag(found));
        }
        return Err(self.invalid());
    }

    /// Body of a `"..."` atom with substitutions expanded.
    fn quoted(&mut self) -> Result<String, Error> {
        let mut value = String::new();
        loop {
            match self.cursor.bump() {
                None => return Err(self.invalid()),
                Some('"') => return Ok(value),
                Some('$') => self.expander.substitute(&mut value, &mut self.cursor, 0)?,
                Some(c) => value.push(c),
            }
        }
    }

    /// `( NAME )` after `defined` or `target`.
    fn call_argument(&mut self) -> Result<String, Error> {
        self.cursor.skip_whitespace();
        if !self.cursor.eat("(") {
            return Err(self.invalid());
        }
        let mut name = String::new();
        loop {
            match self.cursor.bump() {
                None => return Err(self.invalid()),
                Some(')') => return Ok(name.trim().to_string()),
                Some(c) => name.push(c),
            }
        }
    }

    /// Error quoting the unconsumed input.
    fn invalid(&self) -> Error {
        return Error::InvalidExpression { text: self.cursor.rest().to_string() };
    }
}

/// Comparison operator.
enum Op {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// `"1"` or `"0"`.
fn flag(value: bool) -> String {
    return if value { "1" } else { "0" }.to_string();
}

/// Numeric when both sides are integers, bytewise otherwise.
fn compare(left: &str, right: &str) -> Ordering {
    if let (Some(l), Some(r)) = (parse_integer(left), parse_integer(right)) {
        return l.cmp(&r);
    }
    return left.as_bytes().cmp(right.as_bytes());
}

/// Non-empty and not the integer zero.
pub fn is_truthy(value: &str) -> bool {
    return !value.is_empty() && parse_integer(value) != Some(0);
}

/// C-style integer literal: optional sign, `0x` hex, leading-zero octal or
/// decimal. The whole string must be consumed.
pub fn parse_integer(text: &str) -> Option<i64> {
    let negative = text.starts_with('-');
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    let octal = unsigned.strip_prefix('0').filter(|d| return !d.is_empty());
    let (radix, digits) = if let Some(hex) = unsigned.strip_prefix("0x").or_else(|| return unsigned.strip_prefix("0X")) {
        (16, hex)
    } else if let Some(octal) = octal {
        (8, octal)
    } else {
        (10, unsigned)
    };
    if digits.is_empty() || !digits.chars().all(|c| return c.is_digit(radix)) {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    return if negative { magnitude.checked_neg() } else { Some(magnitude) };
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::expand::ExpansionContext;
    use crate::path::Path;
    use crate::scope::{Directory, ScopeKind};
    use crate::types::{File, Macro, MacroValue, Stamp};

    fn tree() -> (ScopeTree, ScopeId) {
        let mut tree = ScopeTree::new(None, Vec::new());
        let root = tree.add_scope("p", None, ScopeKind::Directory(Directory::default()), None);
        let dir = tree.directory_mut(root).unwrap();
        dir.macros.push(Rc::new(Macro {
            help: None,
            name: "OS".into(),
            prepend: None,
            value: MacroValue::Deferred("linux".into()),
        }));
        dir.files.push(File::new("all", None, Stamp::MISSING));
        (tree, root)
    }

    fn eval(text: &str) -> Result<bool, Error> {
        let (tree, root) = tree();
        let prefix = Path::root();
        let ctx = ExpansionContext::none();
        let expander = Expander::new(&tree, root, &prefix, &ctx);
        evaluate(&expander, &tree, root, text)
    }

    #[test]
    fn defined_and_target() {
        assert!(eval("defined(OS)").unwrap());
        assert!(!eval("defined(DEBUG)").unwrap());
        assert!(eval("target( all )").unwrap());
        assert!(!eval("target(install)").unwrap());
    }

    #[test]
    fn negation_and_logic() {
        assert!(eval("!defined(DEBUG)").unwrap());
        assert!(eval("defined(DEBUG) || defined(OS)").unwrap());
        assert!(!eval("defined(DEBUG) && defined(OS)").unwrap());
        assert!(eval("!!defined(OS)").unwrap());
    }

    #[test]
    fn quoted_strings_expand_macros() {
        assert!(eval("\"${OS}\" == \"linux\"").unwrap());
        assert!(eval("\"${OS}\" != \"darwin\"").unwrap());
    }

    #[test]
    fn numeric_comparison_when_both_are_integers() {
        assert!(eval("\"10\" > \"9\"").unwrap());
        assert!(eval("\"0x10\" == \"16\"").unwrap());
        assert!(eval("\"010\" == \"8\"").unwrap());
        assert!(eval("\"abc\" < \"abd\"").unwrap());
        assert!(eval("\"10\" < \"9x\"").unwrap());
        assert!(eval("\"3\" <= \"3\"").unwrap());
        assert!(eval("\"4\" >= \"3\"").unwrap());
    }

    #[test]
    fn bare_truthiness() {
        assert!(!eval("\"\"").unwrap());
        assert!(!eval("\"0\"").unwrap());
        assert!(!eval("\"0x0\"").unwrap());
        assert!(eval("\"1\"").unwrap());
        assert!(eval("\"no\"").unwrap());
    }

    #[test]
    fn malformed_expressions() {
        assert!(matches!(eval("bogus"), Err(Error::InvalidExpression { .. })));
        assert!(matches!(eval("\"open"), Err(Error::InvalidExpression { .. })));
        assert!(matches!(eval("defined OS"), Err(Error::InvalidExpression { .. })));
        assert!(matches!(eval("defined(OS) junk"), Err(Error::InvalidExpression { .. })));
    }

    #[test]
    fn c_integer_literals() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("-7"), Some(-7));
        assert_eq!(parse_integer("0"), Some(0));
        assert_eq!(parse_integer("0x1f"), Some(31));
        assert_eq!(parse_integer("017"), Some(15));
        assert_eq!(parse_integer("09"), None);
        assert_eq!(parse_integer("0x"), None);
        assert_eq!(parse_integer(""), None);
    }
}
