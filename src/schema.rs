use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// What to do with the token (or constant) an attribute covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Consume one token, emit nothing.
    Ignore,
    /// Consume one token (two when the time span applies) and emit a field.
    Store,
    /// Emit a constant without consuming a token.
    Add,
}

impl Action {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(Action::Ignore),
            "1" => Some(Action::Store),
            "2" => Some(Action::Add),
            _ => None,
        }
    }
}

/// Field handler selector. One variant per registered handler kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Int64,
    Int64Sum,
    Double,
    Ip,
    TimeLocal,
    TimeDate,
    Request,
    Status,
    MiscLiveFilter,
}

impl FieldKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(FieldKind::Str),
            "int" => Some(FieldKind::Int),
            "int64" | "long long" => Some(FieldKind::Int64),
            "int64_sum" => Some(FieldKind::Int64Sum),
            "double" => Some(FieldKind::Double),
            "ip" => Some(FieldKind::Ip),
            "time_local" => Some(FieldKind::TimeLocal),
            "time_date" => Some(FieldKind::TimeDate),
            "request" => Some(FieldKind::Request),
            "status" => Some(FieldKind::Status),
            "misc_live_filter" => Some(FieldKind::MiscLiveFilter),
            _ => None,
        }
    }
}

/// One schema attribute: `name : [kind, action(, constant)?] ;`
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub kind: FieldKind,
    pub action: Action,
    /// Constant emitted by ADD attributes.
    pub constant: Option<String>,
}

/// Aggregation policy: sum `keys` across records sharing a time bucket
/// and a hash of their `terms` values.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub keys: Vec<String>,
    pub time: String,
    /// Bucket length in seconds; 0 means a single global bucket.
    pub interval: i64,
    pub terms: Vec<String>,
}

/// Parsed per-source schema: field layout, per-field handling, and the
/// optional aggregation policy.
#[derive(Debug, Clone)]
pub struct Schema {
    /// Becomes the `type` field of every emitted record.
    pub name: String,
    /// Expected token count; 0 = unbounded.
    pub field_number: usize,
    /// 1-based index of the timestamp field; 0 = none.
    pub time_index: usize,
    /// If > 0, the timestamp occupies two adjacent tokens joined by a space.
    pub time_span: usize,
    pub attributes: Vec<Attribute>,
    pub aggregation: Option<Aggregation>,
}

impl Schema {
    /// Parses schema source text.
    ///
    /// Grammar:
    /// ```text
    /// NAME ( FIELDS , TIME_IDX , TIME_SPAN )
    /// { ( NAME : [ KIND , ACTION (, CONST)? ] ; )* }
    /// ( KEYS , TIME_FIELD , INTERVAL ) [ TERM , ... ]?
    /// ```
    /// Names are bare `[A-Za-z0-9_]+` or double-quoted with `\"` escapes;
    /// `/* ... */` comments are whitespace. KEYS is a single name or a
    /// bracketed list.
    pub fn parse(src: &str) -> Result<Self> {
        let mut p = Scanner::new(src);

        let name = p.name().context("schema name")?;
        p.expect('(')?;
        let field_number = p.integer().context("field number")?;
        p.expect(',')?;
        let time_index = p.integer().context("time index")?;
        p.expect(',')?;
        let time_span = p.integer().context("time span")?;
        p.expect(')')?;

        p.expect('{')?;
        let mut attributes = Vec::new();
        while !p.eat('}') {
            if p.peek().is_none() {
                bail!("unexpected end of schema, missing '}}'");
            }
            attributes.push(p.attribute()?);
        }

        let aggregation = if p.eat('(') {
            Some(p.aggregation()?)
        } else {
            None
        };

        p.end()?;

        if field_number < 0 || time_index < 0 || time_span < 0 {
            bail!("schema header values must be non-negative");
        }

        let schema = Schema {
            name,
            field_number: field_number as usize,
            time_index: time_index as usize,
            time_span: time_span as usize,
            attributes,
            aggregation,
        };
        schema.validate()?;

        Ok(schema)
    }

    /// Loads and parses a schema file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema file {}", path.display()))?;
        Self::parse(&src).with_context(|| format!("parsing schema file {}", path.display()))
    }

    /// Forces the aggregation time attribute to STORE. Must run before a
    /// cycle starts so the bucket timestamp is always materialized.
    pub fn normalize(&mut self) {
        let Some(agg) = &self.aggregation else {
            return;
        };
        let time = agg.time.clone();
        for attr in &mut self.attributes {
            if attr.name == time {
                attr.action = Action::Store;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let names: HashSet<&str> = self.attributes.iter().map(|a| a.name.as_str()).collect();

        for attr in &self.attributes {
            if attr.action == Action::Add && attr.constant.is_none() {
                bail!("ADD attribute {} needs a constant", attr.name);
            }
        }

        if let Some(agg) = &self.aggregation {
            if agg.interval < 0 {
                bail!("aggregation interval must be non-negative");
            }
            for key in &agg.keys {
                if !names.contains(key.as_str()) {
                    bail!("aggregation key {key} is not a schema attribute");
                }
            }
            if !names.contains(agg.time.as_str()) {
                bail!("aggregation time field {} is not a schema attribute", agg.time);
            }
            for term in &agg.terms {
                if !names.contains(term.as_str()) {
                    bail!("aggregation term {term} is not a schema attribute");
                }
            }
        }

        Ok(())
    }
}

/// Hand-rolled scanner over the schema grammar. Whitespace and `/* */`
/// comments are skipped between tokens; quoted and bare names are lexemes.
struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn skip(&mut self) {
        loop {
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.src[self.pos..].starts_with(b"/*") {
                match self.src[self.pos + 2..]
                    .windows(2)
                    .position(|w| w == b"*/")
                {
                    Some(end) => self.pos += 2 + end + 2,
                    None => {
                        // Unterminated comment swallows the rest.
                        self.pos = self.src.len();
                    }
                }
            } else {
                return;
            }
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip();
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch as u8) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<()> {
        if !self.eat(ch) {
            bail!("expected '{ch}' at offset {}", self.pos);
        }
        Ok(())
    }

    fn name(&mut self) -> Result<String> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = self.pos;
                while self
                    .src
                    .get(self.pos)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
                {
                    self.pos += 1;
                }
                Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
            }
            _ => bail!("expected a name at offset {}", self.pos),
        }
    }

    fn quoted(&mut self) -> Result<String> {
        self.pos += 1; // opening quote
        let mut out = Vec::new();
        while let Some(&c) = self.src.get(self.pos) {
            match c {
                b'"' => {
                    self.pos += 1;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                b'\\' if self.src.get(self.pos + 1) == Some(&b'"') => {
                    out.push(b'"');
                    self.pos += 2;
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        bail!("unterminated quoted name");
    }

    fn integer(&mut self) -> Result<i64> {
        self.skip();
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.src.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.pos == start {
            bail!("expected an integer at offset {}", start);
        }
        std::str::from_utf8(&self.src[start..self.pos])?
            .parse()
            .context("integer out of range")
    }

    /// `name : [ kind , action (, const)? ] ;`
    fn attribute(&mut self) -> Result<Attribute> {
        let name = self.name()?;
        self.expect(':')?;
        self.expect('[')?;
        let elems = self.name_list(']')?;
        self.expect(';')?;

        if elems.len() < 2 || elems.len() > 3 {
            bail!("attribute {name} needs [kind, action] or [kind, action, const]");
        }

        let kind = FieldKind::from_name(&elems[0])
            .with_context(|| format!("unknown attribute kind {} for {name}", elems[0]))?;
        let action = Action::from_code(&elems[1])
            .with_context(|| format!("unknown action {} for {name}", elems[1]))?;
        let constant = elems.into_iter().nth(2);

        Ok(Attribute {
            name,
            kind,
            action,
            constant,
        })
    }

    /// Comma-separated names up to (and consuming) the closing delimiter.
    fn name_list(&mut self, close: char) -> Result<Vec<String>> {
        let mut names = vec![self.name()?];
        while self.eat(',') {
            names.push(self.name()?);
        }
        self.expect(close)?;
        Ok(names)
    }

    /// `KEYS , time , interval ) ( [ term, ... ] )?` -- the opening paren
    /// has already been consumed. KEYS is a name or a bracketed list.
    fn aggregation(&mut self) -> Result<Aggregation> {
        let keys = if self.eat('[') {
            self.name_list(']')?
        } else {
            vec![self.name()?]
        };
        self.expect(',')?;
        let time = self.name()?;
        self.expect(',')?;
        let interval = self.integer().context("aggregation interval")?;
        self.expect(')')?;

        let terms = if self.eat('[') {
            self.name_list(']')?
        } else {
            Vec::new()
        };

        Ok(Aggregation {
            keys,
            time,
            interval,
            terms,
        })
    }

    fn end(&mut self) -> Result<()> {
        if let Some(c) = self.peek() {
            bail!("trailing input at offset {}: '{}'", self.pos, c as char);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "nginx(3, 0, 0) {
        a: [string, 1];
        b: [int, 1];
        c: [double, 1];
    }";

    #[test]
    fn test_parse_basic_schema() {
        let schema = Schema::parse(BASIC).expect("parse");
        assert_eq!(schema.name, "nginx");
        assert_eq!(schema.field_number, 3);
        assert_eq!(schema.time_index, 0);
        assert_eq!(schema.time_span, 0);
        assert_eq!(schema.attributes.len(), 3);
        assert!(schema.aggregation.is_none());

        let b = &schema.attributes[1];
        assert_eq!(b.name, "b");
        assert_eq!(b.kind, FieldKind::Int);
        assert_eq!(b.action, Action::Store);
    }

    #[test]
    fn test_parse_actions_and_constants() {
        let schema = Schema::parse(
            "web(2, 0, 0) {
                skip: [string, 0];
                val: [int64, 1];
                tag: [string, 2, prod];
            }",
        )
        .expect("parse");

        assert_eq!(schema.attributes[0].action, Action::Ignore);
        assert_eq!(schema.attributes[2].action, Action::Add);
        assert_eq!(schema.attributes[2].constant.as_deref(), Some("prod"));
    }

    #[test]
    fn test_parse_comments_and_quoted_names() {
        let schema = Schema::parse(
            "/* access log */ \"front end\"(1, 0, 0) {
                /* the only field */
                msg: [string, 1];
            }",
        )
        .expect("parse");
        assert_eq!(schema.name, "front end");
        assert_eq!(schema.attributes[0].name, "msg");
    }

    #[test]
    fn test_parse_aggregation_single_key() {
        let schema = Schema::parse(
            "agg(2, 0, 0) {
                time: [int64, 1];
                bytes: [int64, 1];
            } (bytes, time, 60)",
        )
        .expect("parse");

        let agg = schema.aggregation.expect("aggregation");
        assert_eq!(agg.keys, vec!["bytes"]);
        assert_eq!(agg.time, "time");
        assert_eq!(agg.interval, 60);
        assert!(agg.terms.is_empty());
    }

    #[test]
    fn test_parse_aggregation_key_list_and_terms() {
        let schema = Schema::parse(
            "agg(3, 0, 0) {
                time: [int64, 1];
                bytes: [int64, 1];
                host: [string, 1];
            } ([bytes, time], time, 300) [host]",
        )
        .expect("parse");

        let agg = schema.aggregation.expect("aggregation");
        assert_eq!(agg.keys, vec!["bytes", "time"]);
        assert_eq!(agg.terms, vec!["host"]);
    }

    #[test]
    fn test_normalize_forces_time_store() {
        let mut schema = Schema::parse(
            "agg(2, 0, 0) {
                time: [int64, 0];
                bytes: [int64, 1];
            } (bytes, time, 60)",
        )
        .expect("parse");

        assert_eq!(schema.attributes[0].action, Action::Ignore);
        schema.normalize();
        assert_eq!(schema.attributes[0].action, Action::Store);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Schema::parse("x(1,0,0) { a: [blob, 1]; }").unwrap_err();
        assert!(err.to_string().contains("unknown attribute kind"));
    }

    #[test]
    fn test_aggregation_key_must_be_attribute() {
        let err = Schema::parse(
            "x(1,0,0) { time: [int64, 1]; } (missing, time, 60)",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn test_add_requires_constant() {
        let err = Schema::parse("x(1,0,0) { a: [string, 2]; }").unwrap_err();
        assert!(format!("{err:#}").contains("constant"));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(Schema::parse("x(1,0,0) { a: [string, 1]; } junk junk").is_err());
    }

    #[test]
    fn test_truncated_schema_rejected() {
        assert!(Schema::parse("x(1,0,0) { a: [string, 1];").is_err());
        assert!(Schema::parse("x(1,0,0) { a: [string, 1]; } (bytes, time,").is_err());
    }

    #[test]
    fn test_demo_schema_parses() {
        let mut schema = Schema::from_file(Path::new("demos/nginx.schema")).expect("demo schema");
        schema.normalize();

        assert_eq!(schema.name, "nginx");
        assert_eq!(schema.field_number, 9);
        assert_eq!(schema.time_index, 4);
        assert_eq!(schema.attributes.len(), 9);

        let agg = schema.aggregation.expect("aggregation");
        assert_eq!(agg.keys, vec!["body_bytes_sent"]);
        assert_eq!(agg.time, "time_local");
        assert_eq!(agg.interval, 60);
        assert_eq!(agg.terms, vec!["status"]);
    }
}
