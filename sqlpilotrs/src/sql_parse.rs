//! Lexical helpers for user-submitted SQL: statement splitting, comment
//! stripping and statement classification. No grammar, only a quote- and
//! comment-aware scanner.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Walks `sql`, calling `emit` for each char with the lexical state it is in.
fn scan(sql: &str, mut emit: impl FnMut(State, char)) {
    let chars: Vec<char> = sql.chars().collect();
    let mut state = State::Code;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match (c, next) {
                ('-', Some('-')) => {
                    state = State::LineComment;
                    emit(state, c);
                }
                ('/', Some('*')) => {
                    state = State::BlockComment;
                    emit(state, c);
                    emit(state, '*');
                    i += 1;
                }
                ('\'' | '"' | '`', _) => {
                    state = State::Quoted(c);
                    emit(state, c);
                }
                _ => emit(state, c),
            },
            State::Quoted(q) => {
                emit(state, c);
                if c == q {
                    // doubled quote is an escape
                    if next == Some(q) {
                        emit(state, q);
                        i += 1;
                    } else {
                        state = State::Code;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    emit(state, c);
                } else {
                    emit(state, c);
                }
            }
            State::BlockComment => {
                emit(state, c);
                if c == '*' && next == Some('/') {
                    emit(state, '/');
                    i += 1;
                    state = State::Code;
                }
            }
        }
        i += 1;
    }
}

/// Split on `;` outside quotes and comments; empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    scan(sql, |state, c| {
        if state == State::Code && c == ';' {
            statements.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    });
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !strip_comments(s).is_empty())
        .collect()
}

/// Remove `--` and `/* */` comments, keeping quoted text intact.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut prev = State::Code;
    scan(sql, |state, c| {
        match state {
            State::Code | State::Quoted(_) => out.push(c),
            // keeps `a/* x */b` from fusing into one token
            State::BlockComment if prev != State::BlockComment => out.push(' '),
            _ => {}
        }
        prev = state;
    });
    out.trim().to_string()
}

/// First keyword of the statement, upper-cased, ignoring comments and
/// leading parentheses.
pub fn first_keyword(sql: &str) -> Option<String> {
    let stripped = strip_comments(sql);
    stripped
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_uppercase)
}

pub fn is_select(sql: &str) -> bool {
    matches!(first_keyword(sql).as_deref(), Some("SELECT") | Some("WITH"))
}

/// Statements that only read metadata.
pub fn is_readonly(sql: &str) -> bool {
    is_select(sql)
        || matches!(
            first_keyword(sql).as_deref(),
            Some("SHOW") | Some("DESCRIBE") | Some("DESC") | Some("EXPLAIN")
        )
}

/// `CREATE TABLE <table> AS <sql>`, optionally dropping the table first.
pub fn as_create_table(table_name: &str, sql: &str, overwrite: bool) -> String {
    let body = crate::dialect::strip_statement(&strip_comments(sql)).to_string();
    let mut exec_sql = String::new();
    if overwrite {
        exec_sql.push_str(&format!("DROP TABLE IF EXISTS {table_name};\n"));
    }
    exec_sql.push_str(&format!("CREATE TABLE {table_name} AS \n{body}"));
    exec_sql
}
