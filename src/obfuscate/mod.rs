//! SQL statement fingerprinting.
//!
//! Rewrites raw statement text into a canonical, parameter-free form so that
//! distinct parameterisations of the same statement fold into one metric
//! series. The rewrite is a fixed pipeline: strings and comments go first
//! (so literals inside them are never mistaken for numbers), casts go before
//! numbers (so `42::int` does not leave a stray `::int` behind), and list
//! collapsing runs after value substitution (so tuples are uniform `(?, ?)`
//! by the time they are folded into `(?)`).

use once_cell::sync::Lazy;
use regex::Regex;

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").expect("placeholder regex"));
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[+-]?(?:\d+\.\d+|\d+\.|\.\d+|\d+)(?:e[+-]?\d+)?").expect("number regex")
});
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_TYPECAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\s*::\s*"?\w+"?(?:\(\s*\d*\s*\))?(?:\[\s*\])?"#).expect("typecast regex")
});
static RE_OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([!#$%&*+\-/:<=>@^~|]+)").expect("operator regex"));
static RE_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([(),;\[\]{}])").expect("punctuation regex"));
static RE_BOOLEAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\W)(:?true|false|null)(\W|$)").expect("boolean regex"));
static RE_VALUES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(values?)\s*(?:\(\s*\?\s*\)\s*,?\s*)+").expect("values regex"));

/// Fingerprint a SQL statement.
///
/// Deterministic and total: any input, including truncated statements with
/// unterminated strings or comments, produces a fingerprint. Applying the
/// function to its own output is a no-op.
pub fn sql(query: &str) -> String {
    let query = query.to_lowercase();
    let query = remove_comments_and_strings(&query);
    let query = RE_WHITESPACE.replace_all(&query, " ");
    let query = RE_PLACEHOLDER.replace_all(&query, "?");
    let query = RE_TYPECAST.replace_all(&query, "");
    let query = RE_NUMBER.replace_all(&query, "?");
    let query = RE_BOOLEAN.replace_all(&query, "${1}?${3}");

    let query = collapse_lists(&query);
    let query = RE_VALUES.replace_all(&query, "${1}(?)");

    let query = RE_OPERATOR.replace_all(&query, " ${1} ");
    let query = RE_PUNCTUATION.replace_all(&query, " ${1} ");
    let query = RE_WHITESPACE.replace_all(&query, " ");
    let query = query.replace(" ,", ",");
    query.trim_matches([' ', ';']).to_string()
}

/// Char-indexed view of the input with a safe out-of-bounds read, so the
/// scanner can look behind and ahead without byte-offset bookkeeping.
struct Chars {
    data: Vec<char>,
}

impl Chars {
    fn new(s: &str) -> Self {
        Self {
            data: s.chars().collect(),
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, i: usize) -> char {
        self.data.get(i).copied().unwrap_or('\0')
    }
}

/// Strip comments and replace every string literal with a single `?`.
///
/// Handles single-quoted strings with the doubled-quote escape, C-style
/// escaped strings (`e'...'`), dollar-quoted strings (`$$...$$`), bit and
/// hex strings (`b'...'`, `x'...'`), single-line comments (trailing newline
/// preserved) and multi-line comments. A literal or comment left
/// unterminated by server-side truncation still collapses cleanly.
fn remove_comments_and_strings(query: &str) -> String {
    let q = Chars::new(query);
    let mut res = String::with_capacity(q.len());
    let mut i = 0;
    while i < q.len() {
        let curr = q.get(i);
        let next = q.get(i + 1);
        match (curr, next) {
            ('\'', _) => {
                // string constant
                i += 1;
                while i < q.len() {
                    if q.get(i) == '\'' {
                        if q.get(i + 1) == '\'' {
                            // escaped quote
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                res.push('?');
                i += 1;
            }
            ('e', '\'') => {
                // C-style escaped string; a backslash escape wins over the
                // doubled-quote escape when both could apply
                i += 2;
                while i < q.len() {
                    if q.get(i) == '\'' {
                        if q.get(i - 1) == '\\' && q.get(i - 2) != '\\' {
                            // backslash-escaped quote
                            i += 1;
                            continue;
                        }
                        if q.get(i + 1) == '\'' {
                            // doubled quote
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                res.push('?');
                i += 1;
            }
            ('$', '$') => {
                // dollar-quoted string
                i += 2;
                while i < q.len() {
                    if q.get(i - 1) == '$' && q.get(i) == '$' {
                        break;
                    }
                    i += 1;
                }
                res.push('?');
                i += 1;
            }
            ('b', '\'') | ('x', '\'') => {
                // bit / hex string
                i += 2;
                while i < q.len() {
                    if q.get(i) == '\'' {
                        break;
                    }
                    i += 1;
                }
                res.push('?');
                i += 1;
            }
            ('-', '-') => {
                // single-line comment, keep the terminating newline
                i += 2;
                while i < q.len() {
                    if q.get(i) == '\n' {
                        res.push('\n');
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ('/', '*') => {
                // multi-line comment
                i += 2;
                while i < q.len() {
                    if q.get(i - 1) == '*' && q.get(i) == '/' {
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            _ => {
                res.push(curr);
                i += 1;
            }
        }
    }
    res
}

/// Collapse a parenthesised or bracketed expression that contains only `?`,
/// whitespace and commas (nested to any depth) into `(?)` / `[?]`. A list
/// left open at end of input collapses too.
fn collapse_lists(query: &str) -> String {
    let q = Chars::new(query);
    let mut res = String::with_capacity(q.len());
    let mut i = 0;
    while i < q.len() {
        let curr = q.get(i);
        if curr == '(' || curr == '[' {
            let (open, close, collapsed) = if curr == '(' {
                ('(', ')', "(?)")
            } else {
                ('[', ']', "[?]")
            };
            let mut j = i + 1;
            let mut level = 1;
            let mut uniform = true;
            while j < q.len() && level > 0 {
                let c = q.get(j);
                if c == open {
                    level += 1;
                } else if c == close {
                    level -= 1;
                } else if c != '?' && c != ' ' && c != ',' {
                    uniform = false;
                    break;
                }
                j += 1;
            }
            if uniform {
                res.push_str(collapsed);
                i = j;
                continue;
            }
        }
        res.push(curr);
        i += 1;
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_comments_and_strings() {
        for (input, expected) in [
            (
                r#"select '你好', 柱子 from "桌子""#,
                r#"select ?, 柱子 from "桌子""#,
            ),
            ("/*comment*/query", "query"),
            ("/**/ query", " query"),
            ("/**/ query 1 /*comment1*/ /*comment2*/query2", " query 1  query2"),
            ("/* comment */query --comment --foo /", "query "),
            (
                "select --comment1 \n from--comment2\n where",
                "select \n from\n where",
            ),
            ("/* comment */query \n, foo --comment /", "query \n, foo "),
            (
                "/* multi-line \n comment */query \n, foo --comment /",
                "query \n, foo ",
            ),
            ("/* --comment */select 1", "select 1"),
            (
                "/* comment */query \n, foo --comment \n bar --comment /",
                "query \n, foo \n bar ",
            ),
            (
                "select * from t where f = 'foo --fake comment' and bar",
                "select * from t where f = ? and bar",
            ),
            (
                "select * from t where f = 'foo /*fake comment*/' and bar",
                "select * from t where f = ? and bar",
            ),
            // escaped quote
            (
                "select * from t where f = 'foo ''/*fake comment*/' and bar",
                "select * from t where f = ? and bar",
            ),
            // dollar-quoted string constant
            (
                "select * from t where f = $$foo /*fake comment*/$$ and bar",
                "select * from t where f = ? and bar",
            ),
            // truncated query
            (
                "select * from t where f = 'foo --fake comment",
                "select * from t where f = ?",
            ),
            // truncated query with escaped quote
            (
                "select * from t where f = 'foo ''--fake comment''",
                "select * from t where f = ?",
            ),
            (
                "select * from t where f = $$foo --fake comment",
                "select * from t where f = ?",
            ),
            // C-style escapes
            (r"select e' \' \\'' \\' as", "select ? as"),
            // bit strings
            (
                "select b'1000', x'ff' from t where id in (b'100', x'ff')",
                "select ?, ? from t where id in (?, ?)",
            ),
        ] {
            assert_eq!(remove_comments_and_strings(input), expected, "{input}");
        }
    }

    #[test]
    fn test_replace_numbers() {
        for (input, expected) in [
            ("42", "?"),
            ("3.5", "?"),
            ("4.", "?"),
            (".001", "?"),
            ("5e2", "?"),
            ("+5e-2", "?"),
            ("42, 3.5, 4., .001  , 5e2", "?, ?, ?, ?, ?"),
            // digits embedded in identifiers are fingerprinted too
            ("tbl2", "tbl?"),
            ("tbl2s", "tbl?s"),
            ("col12v3", "col?v?"),
        ] {
            assert_eq!(sql(input), expected, "{input}");
        }
    }

    #[test]
    fn test_collapse_lists() {
        for (input, expected) in [
            ("foo in (?, ?, ?, ? , ? ) and bar", "foo in (?) and bar"),
            ("foo in(?, ?, ?, ? , ? )", "foo in(?)"),
            ("foo or (bar and id in (?, ?))", "foo or (bar and id in (?))"),
            ("foo in (?, ?,", "foo in (?)"),
            ("select array[?, ? ,?], foo", "select array[?], foo"),
            ("select array[?, ? ", "select array[?]"),
            ("select array[[?, ? ], [? ,?]]", "select array[?]"),
            ("select array [[?, ? ], [? ,", "select array [?]"),
            ("select any(array[[?, ? ], [? ,?]])", "select any(array[?])"),
            ("values(?, ?), (?, ?)", "values(?), (?)"),
            ("values(?, ?), (", "values(?), (?)"),
            ("values((?), (?))", "values(?)"),
            ("values((?), (?)", "values(?)"),
        ] {
            assert_eq!(collapse_lists(input), expected, "{input}");
        }
    }

    #[test]
    fn test_sql() {
        for (input, expected) in [
            (
                "select null, 5.001 ,true::bool, count(truefield) from \"truetable\",truetable2, truetable3 where d=123 and b is null and c=false and d  = true",
                "select ?, ?, ?, count ( truefield ) from \"truetable\", truetable?, truetable? where d = ? and b is ? and c = ? and d = ?",
            ),
            // type casts
            (
                "select a::int, b::int[], c::varchar(256), d::varchar(256)[], array[ a::int ], e :: \"foo_8\"( 8 )[ ] where id in (c::int)",
                "select a, b, c, d, array [ a ], e where id in ( c )",
            ),
            (
                "SELECT col235v1::\"int_8\"[] AS foo --comment\n\tFROM table1\n \tWHERE col123 IN(42, 3.5::int, $1 ) AND s=E'''' AND j->>2 = +5e-2",
                "select col?v? as foo from table? where col? in ( ? ) and s = ? and j ->> ? = ?",
            ),
            (
                "SELECT price*currency, price/currency*100 from invoice",
                "select price * currency, price / currency * ? from invoice",
            ),
            (
                "SELECT * FROM (ValUes (1, 'one'), (2, 'two'), (3, 'three')) AS t (num,letter)",
                "select * from ( values ( ? ) ) as t ( num, letter )",
            ),
            (
                "select ARRAY[1.1,2.1,3.1]::int[] = ARRAY[1,2,3]",
                "select array [ ? ] = array [ ? ]",
            ),
            (
                "select t.field from schema.table as t",
                "select t.field from schema.table as t",
            ),
            (
                "select t.\"field\" from \"schema\".\"table\" as t",
                "select t.\"field\" from \"schema\".\"table\" as t",
            ),
            (
                "insert into foo(a, b, c) values(2, 4, 5) , (2,4,5)",
                "insert into foo ( a, b, c ) values ( ? )",
            ),
            (
                "insert into foo(a, b, c) value(2, 4, 5) , (2,4,5)",
                "insert into foo ( a, b, c ) value ( ? )",
            ),
            ("select value, 'a', 2 from t", "select value, ?, ? from t"),
            (
                "INSERT INTO test VALUES (B'10'::bit(3), B'101')",
                "insert into test values ( ? )",
            ),
            (
                "insert into t values (1), (2), (3)\n\n\ton duplicate key update query_count=1",
                "insert into t values ( ? ) on duplicate key update query_count = ?",
            ),
            (
                "SELECT * FROM articles WHERE id > 10 ORDER BY id asc LIMIT 15,20",
                "select * from articles where id > ? order by id asc limit ?, ?",
            ),
            (
                "SELECT * FROM articles WHERE (articles.created_at BETWEEN '2020-10-31' AND '2021-11-01')",
                "select * from articles where ( articles.created_at between ? and ? )",
            ),
            (
                "SELECT * FROM articles WHERE (articles.created_at BETWEEN $1 AND $2)",
                "select * from articles where ( articles.created_at between ? and ? )",
            ),
            ("SAVEPOINT \"s139956586256192_x1\"", "savepoint \"s?_x?\""),
            (
                "select lower('DdD'), cast(f as text)",
                "select lower ( ? ), cast ( f as text )",
            ),
            ("  select 1 ; ", "select ?"),
            // truncated list
            (
                "SELECT * FROM t WHERE id IN (1, 2, 3)",
                "select * from t where id in ( ? )",
            ),
            (
                "INSERT INTO foo(a,b) VALUES (1,'x'),(2,'y')",
                "insert into foo ( a, b ) values ( ? )",
            ),
            ("select e'\\'' from t /* c */ -- tail", "select ? from t"),
            ("select b'1010', x'ff'", "select ?, ?"),
            (
                "SELECT col1::int, col2::\"T\"(8)[] FROM t",
                "select col?, col? from t",
            ),
        ] {
            assert_eq!(sql(input), expected, "{input}");
        }
    }

    #[test]
    fn test_sql_is_idempotent() {
        for input in [
            "SELECT * FROM t WHERE id IN (1, 2, 3)",
            "INSERT INTO foo(a,b) VALUES (1,'x'),(2,'y')",
            "select e'\\'' from t /* c */ -- tail",
            "SELECT col235v1::\"int_8\"[] AS foo --comment\n\tFROM table1\n \tWHERE col123 IN(42, 3.5::int, $1 ) AND s=E'''' AND j->>2 = +5e-2",
            "select * from t where f = 'foo --fake comment",
            "SELECT price*currency, price/currency*100 from invoice",
            "  select 1 ; ",
        ] {
            let once = sql(input);
            assert_eq!(sql(&once), once, "{input}");
        }
    }

    #[test]
    fn test_sql_folds_literal_variants_together() {
        let variants = [
            "SELECT * FROM t WHERE id IN (1, 2, 3)",
            "select * from t where id in (4,5)",
            "SELECT * FROM t /* batched */ WHERE id IN ($1, $2)",
            "select   *   from t where id in ('a', 'b', 'c')",
        ];
        let first = sql(variants[0]);
        for v in &variants[1..] {
            assert_eq!(sql(v), first, "{v}");
        }
    }
}
