use clap::Parser;
use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use clusterdns::client::{exchange, poll_until, query_message, ExchangeError};
use clusterdns::protocol::types::{DomainName, Message, QueryType, Rcode, RecordType, ResourceRecord};
use clusterdns::settings::parse_nameserver;

fn print_section(heading: &str, rrs: &[ResourceRecord]) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!("{rr}");
    }
}

fn print_response(response: &Message) {
    let header = &response.header;
    println!(
        ";; id {}, {}{}{}{}",
        header.id,
        header.rcode,
        if header.is_authoritative { ", aa" } else { "" },
        if header.is_truncated { ", tc" } else { "" },
        if header.recursion_available { ", ra" } else { "" },
    );

    println!("\n;; QUESTION");
    for question in &response.questions {
        println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);
    }

    print_section("ANSWER", &response.answers);
    print_section("AUTHORITY", &response.authority);
    print_section("ADDITIONAL", &response.additional);
}

fn server_arg(s: &str) -> Result<SocketAddr, String> {
    parse_nameserver(s).ok_or_else(|| format!("'{s}' is not an IP address or socket address"))
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS lookup utility
///
/// Sends a single query over UDP and prints the response.  With
/// --wait, keeps asking until the name has an answer, which is handy
/// for waiting on a freshly started service.
struct Args {
    /// Nameserver to query, as an IP address with optional port
    #[arg(value_parser = server_arg)]
    server: SocketAddr,

    /// Domain name to look up
    domain: DomainName,

    /// Query type to ask for
    #[arg(default_value_t = QueryType::Record(RecordType::A))]
    qtype: QueryType,

    /// How long to wait for each response, in milliseconds
    #[arg(short, long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Keep querying, for up to this many seconds, until the answer
    /// section is not empty
    #[arg(short, long, value_name = "SECS")]
    wait: Option<u64>,

    /// Clear the RD flag
    #[arg(long, action(clap::ArgAction::SetTrue))]
    no_recurse: bool,
}

async fn ask(args: &Args) -> Result<Message, ExchangeError> {
    let query = query_message(args.domain.clone(), args.qtype, !args.no_recurse);
    exchange(args.server, &query, Duration::from_millis(args.timeout_ms)).await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result = match args.wait {
        Some(secs) => poll_until(Duration::from_millis(250), Duration::from_secs(secs), || {
            let args = &args;
            async move {
                match ask(args).await {
                    Ok(response) if response.answers.is_empty() => None,
                    Ok(response) => Some(Ok(response)),
                    Err(_) => None,
                }
            }
        })
        .await
        .unwrap_or(Err(ExchangeError::Timeout)),
        None => ask(&args).await,
    };

    match result {
        Ok(response) => {
            print_response(&response);
            if response.header.rcode != Rcode::NoError {
                process::exit(1);
            }
        }
        Err(error) => {
            eprintln!(";; {error}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_takes_seconds() {
        let args =
            Args::try_parse_from(["dnsq", "127.0.0.1", "kubernetes.default.local.", "--wait", "5"])
                .unwrap();
        assert_eq!(Some(5), args.wait);

        let args =
            Args::try_parse_from(["dnsq", "127.0.0.1", "kubernetes.default.local.", "-w", "2"])
                .unwrap();
        assert_eq!(Some(2), args.wait);
    }
}
