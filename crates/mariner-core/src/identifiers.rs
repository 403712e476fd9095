//! Backtick identifier quoting and a small DDL constraint lexer.
//!
//! MySQL quotes identifiers with backticks and escapes an embedded backtick
//! by doubling it. Server-generated DDL (`SHOW CREATE TABLE`) is the only
//! reliable source for foreign-key constraint details on older servers, so
//! this module also knows how to lex those clauses back out. The lexer is
//! pure and produces structures; it never builds query strings.

/// Quote an identifier with backticks, doubling embedded backticks.
///
/// # Examples
///
/// ```
/// use mariner_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "`users`");
/// assert_eq!(quote_ident("odd`name"), "`odd``name`");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A possibly schema-qualified identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }
}

/// A foreign-key constraint recovered from generated DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub constraint: String,
    pub columns: Vec<String>,
    pub referenced_table: QualifiedName,
    pub referenced_columns: Vec<String>,
}

/// Parse a backtick-quoted, possibly schema-qualified identifier.
///
/// Accepts `` `name` ``, `` `schema`.`name` ``, and unquoted equivalents.
/// Returns `None` on malformed input (unterminated quote, empty part).
pub fn parse_qualified_ident(input: &str) -> Option<QualifiedName> {
    let mut lex = Lexer::new(input);
    lex.skip_ws();
    let first = lex.ident()?;
    lex.skip_ws();
    if lex.eat(b'.') {
        lex.skip_ws();
        let second = lex.ident()?;
        lex.skip_ws();
        if !lex.at_end() {
            return None;
        }
        Some(QualifiedName {
            schema: Some(first),
            name: second,
        })
    } else {
        if !lex.at_end() {
            return None;
        }
        Some(QualifiedName {
            schema: None,
            name: first,
        })
    }
}

/// Extract every FOREIGN KEY constraint from a `SHOW CREATE TABLE` body.
///
/// Clauses look like:
///
/// ```text
/// CONSTRAINT `fk_owner` FOREIGN KEY (`owner_id`) REFERENCES `app`.`users` (`id`)
/// ```
///
/// Malformed clauses are skipped rather than failing the whole scan.
pub fn parse_foreign_keys(ddl: &str) -> Vec<ForeignKey> {
    let mut out = Vec::new();
    let mut lex = Lexer::new(ddl);

    while lex.seek_keyword("CONSTRAINT") {
        if let Some(fk) = parse_constraint_clause(&mut lex) {
            out.push(fk);
        }
    }

    out
}

fn parse_constraint_clause(lex: &mut Lexer<'_>) -> Option<ForeignKey> {
    lex.skip_ws();
    let constraint = lex.ident()?;
    lex.skip_ws();
    lex.eat_keyword("FOREIGN")?;
    lex.skip_ws();
    lex.eat_keyword("KEY")?;
    lex.skip_ws();
    let columns = lex.ident_list()?;
    lex.skip_ws();
    lex.eat_keyword("REFERENCES")?;
    lex.skip_ws();

    let first = lex.ident()?;
    lex.skip_ws();
    let referenced_table = if lex.eat(b'.') {
        lex.skip_ws();
        let name = lex.ident()?;
        QualifiedName {
            schema: Some(first),
            name,
        }
    } else {
        QualifiedName {
            schema: None,
            name: first,
        }
    };

    lex.skip_ws();
    let referenced_columns = lex.ident_list()?;

    if referenced_columns.len() != columns.len() {
        return None;
    }

    Some(ForeignKey {
        constraint,
        columns,
        referenced_table,
        referenced_columns,
    })
}

/// Byte-cursor lexer over DDL text.
struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.rest().as_bytes().first() == Some(&byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume `word` case-insensitively if it starts at the cursor and
    /// ends at a word boundary.
    fn eat_keyword(&mut self, word: &str) -> Option<()> {
        let rest = self.rest().as_bytes();
        if rest.len() < word.len() || !rest[..word.len()].eq_ignore_ascii_case(word.as_bytes()) {
            return None;
        }
        // The matched prefix is ASCII, so word.len() is a char boundary.
        let boundary = self.rest()[word.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_');
        if !boundary {
            return None;
        }
        self.pos += word.len();
        Some(())
    }

    /// Advance past the next occurrence of `word` (case-insensitive, word
    /// boundary on both sides). Returns false when the input is exhausted.
    fn seek_keyword(&mut self, word: &str) -> bool {
        while !self.at_end() {
            let rest = self.rest();
            let Some(offset) = find_ignore_case(rest, word) else {
                self.pos = self.input.len();
                return false;
            };
            let before_ok = offset == 0
                || rest[..offset]
                    .chars()
                    .next_back()
                    .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_' && c != '`');
            self.pos += offset;
            if before_ok && self.eat_keyword(word).is_some() {
                return true;
            }
            // Mid-word hit; step over one byte and keep scanning.
            self.pos += 1;
        }
        false
    }

    /// Read one identifier, backtick-quoted (with `` `` `` escaping) or bare.
    fn ident(&mut self) -> Option<String> {
        if self.eat(b'`') {
            let mut name = String::new();
            loop {
                let rest = self.rest();
                let end = rest.find('`')?;
                name.push_str(&rest[..end]);
                self.pos += end + 1;
                // A doubled backtick is an escaped literal backtick.
                if self.eat(b'`') {
                    name.push('`');
                } else {
                    break;
                }
            }
            if name.is_empty() {
                return None;
            }
            Some(name)
        } else {
            let rest = self.rest();
            let end = rest
                .char_indices()
                .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$')
                .map_or(rest.len(), |(i, _)| i);
            if end == 0 {
                return None;
            }
            self.pos += end;
            Some(rest[..end].to_string())
        }
    }

    /// Read a parenthesized, comma-separated identifier list.
    fn ident_list(&mut self) -> Option<Vec<String>> {
        if !self.eat(b'(') {
            return None;
        }
        let mut idents = Vec::new();
        loop {
            self.skip_ws();
            idents.push(self.ident()?);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b')') {
                return Some(idents);
            }
            return None;
        }
    }
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}
