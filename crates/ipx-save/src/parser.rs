use crate::counters::parse_counters;
use crate::error::{ParseError, ParseErrorKind, ParseErrors, SaveError};
use crate::rule::tokenize_rule;
use ipx_core::{Chain, Table, Tables};
use std::io::BufRead;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Parse `iptables-save -c` output from a blocking reader.
///
/// Stops only on a read failure. Grammar errors are collected across the
/// whole input and fail the parse as a unit.
pub fn parse_iptables_save<R: BufRead>(reader: R) -> Result<Tables, SaveError> {
    let mut parser = Parser::new();

    for line in reader.lines() {
        let line = line.inspect_err(log_read_failure)?;
        parser.handle_line(&line);
    }

    finish(parser)
}

/// Async counterpart of [`parse_iptables_save`], used while the save
/// process is still writing to its pipe.
pub async fn parse_iptables_save_async<R>(reader: R) -> Result<Tables, SaveError>
where
    R: AsyncBufRead + Unpin,
{
    let mut parser = Parser::new();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await.inspect_err(log_read_failure)? {
        parser.handle_line(&line);
    }

    finish(parser)
}

/// Parse an in-memory dump.
pub fn parse_dump(text: &str) -> Result<Tables, ParseErrors> {
    let mut parser = Parser::new();
    for line in text.lines() {
        parser.handle_line(line);
    }
    parser.finish()
}

fn finish(parser: Parser) -> Result<Tables, SaveError> {
    parser.finish().map_err(|errors| {
        tracing::error!(
            errors = errors.len(),
            err = %errors,
            "failed to parse iptables-save"
        );
        SaveError::Parse(errors)
    })
}

fn log_read_failure(err: &std::io::Error) {
    tracing::error!(err = %err, "failed to read iptables-save");
}

/// Table that has been opened by a `*name` header but not flushed yet.
#[derive(Debug)]
struct OpenTable {
    name: String,
    chains: Table,
}

/// Line-oriented scanner state.
#[derive(Debug, Default)]
pub struct Parser {
    result: Tables,
    current: Option<OpenTable>,
    line: usize,
    errors: ParseErrors,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one raw line and update the scan state.
    pub fn handle_line(&mut self, raw: &str) {
        self.line += 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            return;
        }

        if line == "COMMIT" {
            self.flush();
            return;
        }

        if let Some(name) = line.strip_prefix('*') {
            self.open_table(name, line);
            return;
        }

        if line.starts_with(':') {
            self.handle_chain(line);
            return;
        }

        if line.starts_with('[') {
            self.handle_rule(line);
            return;
        }

        self.report(ParseErrorKind::UnhandledLineKind, line);
    }

    /// Final flush, then either the tables or every error seen.
    pub fn finish(mut self) -> Result<Tables, ParseErrors> {
        self.flush();
        if self.errors.is_empty() {
            Ok(self.result)
        } else {
            Err(self.errors)
        }
    }

    /// Commit the open table into the result. No-op without an open table.
    fn flush(&mut self) {
        if let Some(table) = self.current.take() {
            self.result.insert(table.name, table.chains);
        }
    }

    fn open_table(&mut self, name: &str, line: &str) {
        self.flush();
        if name.is_empty() {
            self.report(ParseErrorKind::MalformedTableHeader, line);
            return;
        }
        self.current = Some(OpenTable {
            name: name.to_string(),
            chains: Table::new(),
        });
    }

    fn handle_chain(&mut self, line: &str) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            self.report(ParseErrorKind::MalformedChainHeader, line);
            return;
        }

        let name = fields[0].strip_prefix(':').unwrap_or(fields[0]);
        if name.is_empty() {
            self.report(ParseErrorKind::MalformedChainHeader, line);
            return;
        }

        let Some((packets, bytes)) = parse_counters(fields[2]) else {
            self.report(ParseErrorKind::MalformedCounters, line);
            return;
        };

        let Some(table) = self.current.as_mut() else {
            self.report(ParseErrorKind::OutsideTable, line);
            return;
        };

        // a repeated header starts the chain over
        table
            .chains
            .insert(name.to_string(), Chain::new(fields[1], packets, bytes));
    }

    fn handle_rule(&mut self, line: &str) {
        let parsed = match tokenize_rule(line) {
            Ok(parsed) => parsed,
            Err(kinds) => {
                for kind in kinds {
                    self.report(kind, line);
                }
                return;
            }
        };

        let Some(table) = self.current.as_mut() else {
            self.report(ParseErrorKind::OutsideTable, line);
            return;
        };

        if !table.chains.contains_key(&parsed.chain) {
            tracing::debug!(
                table = %table.name,
                chain = %parsed.chain,
                line = self.line,
                "rule references undeclared chain"
            );
        }

        let chain = table.chains.entry(parsed.chain).or_default();
        if !chain.push_unique(parsed.rule) {
            tracing::trace!(line = self.line, "skipping duplicate rule");
        }
    }

    fn report(&mut self, kind: ParseErrorKind, line: &str) {
        self.errors.push(ParseError::new(kind, self.line, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipx_core::Rule;
    use std::io::{BufReader, Cursor};

    const MINIMAL: &str = "*filter
:INPUT ACCEPT [10:500]
[10:500] -A INPUT -p tcp -m tcp --dport 22 -j ACCEPT
COMMIT
";

    fn chain(policy: &str, packets: u64, bytes: u64, rules: Vec<Rule>) -> Chain {
        Chain {
            policy: policy.to_string(),
            packets,
            bytes,
            rules,
        }
    }

    fn tables(entries: Vec<(&str, Vec<(&str, Chain)>)>) -> Tables {
        entries
            .into_iter()
            .map(|(name, chains)| {
                let table: Table = chains
                    .into_iter()
                    .map(|(chain_name, chain)| (chain_name.to_string(), chain))
                    .collect();
                (name.to_string(), table)
            })
            .collect()
    }

    #[test]
    fn test_minimal_single_table() {
        let result = parse_dump(MINIMAL).unwrap();
        let expected = tables(vec![(
            "filter",
            vec![(
                "INPUT",
                chain(
                    "ACCEPT",
                    10,
                    500,
                    vec![Rule::new(10, 500, "-p tcp -m tcp --dport 22 -j ACCEPT")],
                ),
            )],
        )]);
        assert_eq!(result, expected);
    }

    #[test]
    fn test_duplicate_rules_keep_first_counters() {
        let input = "*filter
:INPUT ACCEPT [10:500]
[10:500] -A INPUT -p tcp -m tcp --dport 22 -j ACCEPT
[99:9999] -A INPUT -p tcp -m tcp --dport 22 -j ACCEPT
[99:9999] -A INPUT -p tcp -m tcp --dport 22 -j ACCEPT
COMMIT
";
        let result = parse_dump(input).unwrap();
        let rules = &result["filter"]["INPUT"].rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].packets, 10);
        assert_eq!(rules[0].bytes, 500);
    }

    #[test]
    fn test_final_table_without_commit() {
        let input = "*filter
:INPUT DROP [1:2]
COMMIT
*nat
:POSTROUTING ACCEPT [3:4]
[3:4] -A POSTROUTING -o eth0 -j MASQUERADE
";
        let result = parse_dump(input).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result["filter"]["INPUT"], chain("DROP", 1, 2, vec![]));
        assert_eq!(
            result["nat"]["POSTROUTING"].rules,
            vec![Rule::new(3, 4, "-o eth0 -j MASQUERADE")]
        );
    }

    #[test]
    fn test_new_table_header_flushes_previous() {
        let input = "*raw
:PREROUTING ACCEPT [5:6]
*mangle
:OUTPUT ACCEPT [7:8]
";
        let result = parse_dump(input).unwrap();
        assert_eq!(result["raw"]["PREROUTING"], chain("ACCEPT", 5, 6, vec![]));
        assert_eq!(result["mangle"]["OUTPUT"], chain("ACCEPT", 7, 8, vec![]));
        assert!(!result["mangle"].contains_key("PREROUTING"));
    }

    #[test]
    fn test_malformed_input_reports_every_line() {
        let input = "*filter
:INPUT ACCEPT
[1:1] -A INPUT -j ACCEPT
something else
COMMIT
";
        let errors = parse_dump(input).unwrap_err();
        let errors = errors.into_vec();
        assert_eq!(errors.len(), 2);

        assert_eq!(errors[0].kind, ParseErrorKind::MalformedChainHeader);
        assert_eq!(errors[0].line_number, 2);
        assert_eq!(errors[0].line_text, ":INPUT ACCEPT");

        assert_eq!(errors[1].kind, ParseErrorKind::UnhandledLineKind);
        assert_eq!(errors[1].line_number, 4);
        assert_eq!(errors[1].line_text, "something else");
    }

    #[test]
    fn test_scan_continues_after_errors() {
        let input = "*filter
bogus one
:INPUT ACCEPT [x:1]
:OUTPUT ACCEPT [0:0]
[0:0] -A OUTPUT -j ACCEPT
[0:0] -j ACCEPT
bogus two
";
        let errors = parse_dump(input).unwrap_err();
        assert_eq!(errors.line_numbers(), vec![2, 3, 6, 7]);

        let kinds: Vec<ParseErrorKind> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParseErrorKind::UnhandledLineKind,
                ParseErrorKind::MalformedCounters,
                ParseErrorKind::MissingTarget,
                ParseErrorKind::UnhandledLineKind,
            ]
        );
    }

    #[test]
    fn test_rule_with_bad_counters_still_checks_target() {
        let input = "*filter
:INPUT ACCEPT [0:0]
[bad] -p tcp -j ACCEPT
";
        let errors = parse_dump(input).unwrap_err();
        assert_eq!(errors.line_numbers(), vec![3]);
        let kinds: Vec<ParseErrorKind> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParseErrorKind::MalformedCounters,
                ParseErrorKind::MissingTarget
            ]
        );
    }

    #[test]
    fn test_whitespace_and_comments_are_ignored() {
        let input = "
# Generated by iptables-save
   *filter
\t:INPUT ACCEPT [1:2]

  # a comment
  [1:2] -A INPUT -j ACCEPT
COMMIT
";
        let result = parse_dump(input).unwrap();
        assert_eq!(result["filter"]["INPUT"].rules.len(), 1);
    }

    #[test]
    fn test_error_line_text_is_trimmed() {
        let errors = parse_dump("*filter\n   nonsense here   \n").unwrap_err();
        let error = errors.iter().next().unwrap();
        assert_eq!(error.line_number, 2);
        assert_eq!(error.line_text, "nonsense here");
    }

    #[test]
    fn test_chain_without_rules_or_counters_is_kept() {
        let result = parse_dump("*filter\n:DOCKER - [0:0]\nCOMMIT\n").unwrap();
        assert_eq!(result["filter"]["DOCKER"], chain("-", 0, 0, vec![]));
    }

    #[test]
    fn test_chain_redeclaration_resets_rules() {
        let input = "*filter
:INPUT ACCEPT [1:1]
[1:1] -A INPUT -j ACCEPT
:INPUT DROP [2:2]
COMMIT
";
        let result = parse_dump(input).unwrap();
        assert_eq!(result["filter"]["INPUT"], chain("DROP", 2, 2, vec![]));
    }

    #[test]
    fn test_rule_for_undeclared_chain_creates_bare_chain() {
        let input = "*filter
[4:240] -A CUSTOM -j LOG
COMMIT
";
        let result = parse_dump(input).unwrap();
        assert_eq!(
            result["filter"]["CUSTOM"],
            chain("", 0, 0, vec![Rule::new(4, 240, "-j LOG")])
        );
    }

    #[test]
    fn test_same_text_in_different_chains_is_not_a_duplicate() {
        let input = "*filter
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
[1:1] -A INPUT -j ACCEPT
[2:2] -A OUTPUT -j ACCEPT
";
        let result = parse_dump(input).unwrap();
        assert_eq!(result["filter"]["INPUT"].rules, vec![Rule::new(1, 1, "-j ACCEPT")]);
        assert_eq!(result["filter"]["OUTPUT"].rules, vec![Rule::new(2, 2, "-j ACCEPT")]);
    }

    #[test]
    fn test_lines_outside_table() {
        let input = ":INPUT ACCEPT [0:0]
*filter
COMMIT
[1:1] -A INPUT -j ACCEPT
";
        let errors = parse_dump(input).unwrap_err();
        assert_eq!(errors.line_numbers(), vec![1, 4]);
        assert!(errors.iter().all(|e| e.kind == ParseErrorKind::OutsideTable));
    }

    #[test]
    fn test_empty_table_name() {
        let errors = parse_dump("*\n:INPUT ACCEPT [0:0]\n").unwrap_err();
        let kinds: Vec<ParseErrorKind> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParseErrorKind::MalformedTableHeader,
                ParseErrorKind::OutsideTable
            ]
        );
    }

    #[test]
    fn test_empty_chain_name() {
        let errors = parse_dump("*filter\n: ACCEPT [0:0]\n").unwrap_err();
        assert_eq!(errors.len(), 1);
        // ": ACCEPT [0:0]" splits into 3 fields with an empty name
        assert_eq!(
            errors.iter().next().unwrap().kind,
            ParseErrorKind::MalformedChainHeader
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_dump("").unwrap().is_empty());
        assert!(parse_dump("# nothing\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_commit_without_open_table_is_noop() {
        let result = parse_dump("COMMIT\nCOMMIT\n*filter\nCOMMIT\nCOMMIT\n").unwrap();
        assert_eq!(result.len(), 1);
        assert!(result["filter"].is_empty());
    }

    #[test]
    fn test_parsing_is_idempotent() {
        let input = include_str!("../testdata/server.iptables-save");
        assert_eq!(parse_dump(input).unwrap(), parse_dump(input).unwrap());
    }

    #[test]
    fn test_server_fixture() {
        let result = parse_iptables_save(Cursor::new(include_str!(
            "../testdata/server.iptables-save"
        )))
        .unwrap();

        assert_eq!(result.len(), 2);

        let filter = &result["filter"];
        assert_eq!(filter.len(), 3);
        assert_eq!(filter["INPUT"].policy, "ACCEPT");
        assert_eq!(filter["INPUT"].packets, 8202915326);
        assert_eq!(filter["INPUT"].bytes, 443356185985);
        assert_eq!(
            filter["INPUT"].rules,
            vec![
                Rule::new(7981319024, 1536987862973, "-p tcp -m tcp --dport 7000 -j ACCEPT"),
                Rule::new(1335166082, 279365222746, "-p tcp -m tcp --dport 9160 -j ACCEPT"),
                Rule::new(27438740, 6089401408, "-p tcp -m tcp --dport 7199 -j ACCEPT"),
                Rule::new(1285509559, 346897300390, "-p tcp -m tcp --dport 9042 -j ACCEPT"),
            ]
        );
        assert_eq!(filter["FORWARD"], chain("ACCEPT", 0, 0, vec![]));
        assert_eq!(filter["OUTPUT"].rules.len(), 4);
        assert_eq!(
            filter["OUTPUT"].rules[3],
            Rule::new(813815825, 429136005552, "-p tcp -m tcp --sport 9042 -j ACCEPT")
        );

        let mangle = &result["mangle"];
        assert_eq!(mangle.len(), 5);
        assert_eq!(
            mangle["POSTROUTING"],
            chain("ACCEPT", 17906945694, 2730159008813, vec![])
        );
    }

    #[test]
    fn test_router_fixture() {
        let result = parse_dump(include_str!("../testdata/router.iptables-save")).unwrap();

        let names: Vec<&str> = result.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["filter", "mangle", "nat"]);

        assert_eq!(result["nat"].len(), 4);
        assert!(result["nat"].values().all(|c| c.rules.is_empty()));
        assert_eq!(
            result["filter"]["INPUT"].rules[2],
            Rule::new(60372, 6729099, "-s 10.10.10.0/24 -j DROP")
        );
        assert_eq!(
            result["mangle"]["FORWARD"],
            chain("ACCEPT", 523179, 34974614, vec![])
        );
    }

    fn libvirt_expected() -> Tables {
        let subnet = "-s 192.168.122.0/24";
        tables(vec![(
            "nat",
            vec![
                (
                    "POSTROUTING",
                    chain(
                        "ACCEPT",
                        539154,
                        42361851,
                        vec![Rule::new(539154, 42361851, "-j LIBVIRT_PRT")],
                    ),
                ),
                (
                    "LIBVIRT_PRT",
                    chain(
                        "-",
                        0,
                        0,
                        vec![
                            Rule::new(2, 176, &format!("{subnet} -d 224.0.0.0/24 -j RETURN")),
                            Rule::new(0, 0, &format!("{subnet} -d 255.255.255.255/32 -j RETURN")),
                            Rule::new(
                                0,
                                0,
                                &format!(
                                    "{subnet} ! -d 192.168.122.0/24 -p tcp -j MASQUERADE --to-ports 1024-65535"
                                ),
                            ),
                            Rule::new(
                                0,
                                0,
                                &format!(
                                    "{subnet} ! -d 192.168.122.0/24 -p udp -j MASQUERADE --to-ports 1024-65535"
                                ),
                            ),
                            Rule::new(
                                0,
                                0,
                                &format!("{subnet} ! -d 192.168.122.0/24 -j MASQUERADE"),
                            ),
                        ],
                    ),
                ),
            ],
        )])
    }

    #[test]
    fn test_libvirt_fixture() {
        let result = parse_dump(include_str!("../testdata/libvirt.iptables-save")).unwrap();
        assert_eq!(result, libvirt_expected());
    }

    #[test]
    fn test_libvirt_fixture_with_duplicates() {
        let result = parse_dump(include_str!("../testdata/libvirt-dup.iptables-save")).unwrap();
        assert_eq!(result, libvirt_expected());
    }

    #[test]
    fn test_read_failure_is_distinct() {
        // invalid UTF-8 surfaces as a read error from the line reader
        let bytes: &[u8] = b"*filter\n:INPUT ACCEPT [0:0]\n\xff\xfe\n";
        let err = parse_iptables_save(BufReader::new(bytes)).unwrap_err();
        assert!(matches!(err, SaveError::Read(_)));
    }

    #[test]
    fn test_parse_failure_through_reader() {
        let err = parse_iptables_save(Cursor::new("*filter\nbogus\n")).unwrap_err();
        let errors = err.parse_errors().unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_async_driver_matches_blocking_driver() {
        let input = include_str!("../testdata/router.iptables-save");
        let blocking = parse_iptables_save(Cursor::new(input)).unwrap();
        let streamed = parse_iptables_save_async(input.as_bytes()).await.unwrap();
        assert_eq!(blocking, streamed);
    }

    #[tokio::test]
    async fn test_async_driver_reports_parse_errors() {
        let err = parse_iptables_save_async("*filter\n:INPUT\n".as_bytes())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "parse");
    }
}
