use std::io::Read;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use arca_api::{
    CreateRequest, DeleteRequest, GetBlobRequest, HistoryRequest, InProcServer, ListManagedObjectsRequest,
    ListRequest, PutBlobRequest, ReadRequest, ResourceServer, StatsRequest, UpdateRequest, WatchEventType,
    WatchRequest,
};
use arca_core::columns::CellValue;
use arca_core::{ErrorResult, NamespacedResource, ResourceKey};
use arca_search::{FacetRequest, Requirement, SearchRequest, SortBy};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "arcactl", version, about = "Arca object store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace; empty for cluster-scoped resources
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Identity recorded on writes
    #[arg(long = "as", global = true, env = "ARCA_REQUESTER", default_value = "arcactl")]
    requester: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a resource, or update it when --rv is given
    Put {
        /// "group/resource", e.g. "dashboard.arca.dev/dashboards"
        gr: String,
        name: String,
        /// JSON file; "-" reads stdin
        #[arg(short = 'f', long = "file", default_value = "-")]
        file: String,
        /// Last observed resource version
        #[arg(long = "rv")]
        rv: Option<i64>,
    },
    /// Print one resource, optionally as of an older version
    Get {
        gr: String,
        name: String,
        #[arg(long = "at", default_value_t = 0)]
        at: i64,
    },
    /// Delete a resource
    Rm {
        gr: String,
        name: String,
        #[arg(long = "rv", default_value_t = 0)]
        rv: i64,
    },
    /// List resources
    Ls {
        gr: String,
        #[arg(long = "limit", default_value_t = 0)]
        limit: usize,
        /// Continue token from a previous page
        #[arg(long = "continue", default_value = "")]
        next: String,
    },
    /// Versions of one resource, newest first
    History {
        gr: String,
        name: String,
        #[arg(long = "limit", default_value_t = 0)]
        limit: usize,
    },
    /// Print +/- events until interrupted
    Watch {
        /// "group/resource"; omit to watch everything
        gr: Option<String>,
        #[arg(long = "since")]
        since: Option<i64>,
        /// Start with the current state
        #[arg(long = "initial", action = ArgAction::SetTrue)]
        initial: bool,
    },
    /// Resource counts per shard
    Stats {
        #[arg(long = "min-count", default_value_t = 0)]
        min_count: i64,
    },
    /// Rebuild the search index of a shard
    Index { gr: String },
    /// Search a shard
    Search {
        gr: String,
        /// Free text, "*" or empty for everything
        #[arg(default_value = "")]
        query: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,
        /// Columns; "_all" for the default projection
        #[arg(long = "field")]
        fields: Vec<String>,
        /// "field" or "field:desc"
        #[arg(long = "sort")]
        sort: Vec<String>,
        /// "key=value"; keys starting with "labels." filter labels
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long = "facet")]
        facets: Vec<String>,
        /// Other shards searched together with this one ("group/resource")
        #[arg(long = "federate")]
        federate: Vec<String>,
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Upload a blob for a resource
    PutBlob {
        gr: String,
        name: String,
        #[arg(short = 'f', long = "file", default_value = "-")]
        file: String,
        #[arg(long = "content-type", default_value = "application/octet-stream")]
        content_type: String,
    },
    /// Write a blob to stdout: the linked one, or --uid
    GetBlob {
        gr: String,
        name: String,
        #[arg(long = "uid", default_value = "")]
        uid: String,
    },
    /// Resources managed by one manager
    Managed { kind: String, id: String },
}

fn init_tracing() {
    let env = std::env::var("ARCA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARCA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARCA_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_gr(gr: &str) -> Result<(String, String)> {
    match gr.split_once('/') {
        Some((g, r)) if !g.is_empty() && !r.is_empty() && !r.contains('/') => Ok((g.to_string(), r.to_string())),
        _ => bail!("expected group/resource, got '{}'", gr),
    }
}

fn shard(ns: &str, gr: &str) -> Result<NamespacedResource> {
    let (g, r) = parse_gr(gr)?;
    Ok(NamespacedResource::new(ns, &g, &r))
}

fn resource_key(ns: &str, gr: &str, name: &str) -> Result<ResourceKey> {
    let (g, r) = parse_gr(gr)?;
    Ok(ResourceKey::new(&g, &r, ns, name))
}

fn read_input(file: &str) -> Result<Vec<u8>> {
    if file == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("read stdin")?;
        Ok(buf)
    } else {
        std::fs::read(file).with_context(|| format!("read {}", file))
    }
}

fn check(error: Option<ErrorResult>) -> Result<()> {
    match error {
        Some(e) => Err(anyhow!(e)),
        None => Ok(()),
    }
}

fn parse_sort(s: &str) -> SortBy {
    match s.rsplit_once(':') {
        Some((f, "desc")) => SortBy::desc(f),
        Some((f, "asc")) => SortBy::asc(f),
        _ => SortBy::asc(s),
    }
}

fn cell_text(v: &CellValue) -> String {
    match v {
        CellValue::Null => String::new(),
        CellValue::String(s) => s.clone(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Int(i) | CellValue::DateTime(i) => i.to_string(),
        CellValue::Double(d) => format!("{:.3}", d),
        CellValue::Strings(v) => v.join(","),
        CellValue::Json(j) => j.to_string(),
    }
}

fn print_value(output: Output, value: &[u8]) -> Result<()> {
    let v: serde_json::Value = serde_json::from_slice(value).context("stored value is not JSON")?;
    match output {
        Output::Human => println!("{}", serde_json::to_string_pretty(&v)?),
        Output::Json => println!("{}", serde_json::to_string(&v)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let server = InProcServer::open_from_env()?;
    let ctx = CancellationToken::new();
    let ns = cli.namespace.as_str();
    let requester = cli.requester.clone();

    match cli.command {
        Commands::Put { gr, name, file, rv } => {
            let key = resource_key(ns, &gr, &name)?;
            let value = read_input(&file)?;
            let (rv, error) = match rv {
                None => {
                    let rsp = server.create(&ctx, CreateRequest { key, value, requester }).await?;
                    (rsp.resource_version, rsp.error)
                }
                Some(previous) => {
                    let req = UpdateRequest { key, value, resource_version: previous, requester };
                    let rsp = server.update(&ctx, req).await?;
                    (rsp.resource_version, rsp.error)
                }
            };
            check(error)?;
            println!("{}", rv);
        }
        Commands::Get { gr, name, at } => {
            let key = resource_key(ns, &gr, &name)?;
            let rsp = server.read(&ctx, ReadRequest { key, resource_version: at, requester }).await?;
            check(rsp.error)?;
            if cli.output == Output::Human {
                eprintln!("rv: {}  folder: {}", rsp.resource_version, rsp.folder);
            }
            print_value(cli.output, &rsp.value)?;
        }
        Commands::Rm { gr, name, rv } => {
            let key = resource_key(ns, &gr, &name)?;
            let rsp = server.delete(&ctx, DeleteRequest { key, resource_version: rv, requester }).await?;
            check(rsp.error)?;
            println!("{}", rsp.resource_version);
        }
        Commands::Ls { gr, limit, next } => {
            let key = resource_key(ns, &gr, "")?;
            let rsp = server.list(&ctx, ListRequest { key, limit, next_page_token: next, requester, ..Default::default() }).await?;
            check(rsp.error)?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<32} {}", "NAMESPACE", "NAME", "RV");
                    for item in &rsp.items {
                        println!("{:<16} {:<32} {}", item.key.namespace, item.key.name, item.resource_version);
                    }
                    if !rsp.next_page_token.is_empty() {
                        eprintln!("continue: {}", rsp.next_page_token);
                    }
                }
                Output::Json => {
                    let items: Vec<serde_json::Value> = rsp
                        .items
                        .iter()
                        .map(|i| {
                            let value: serde_json::Value = serde_json::from_slice(&i.value).unwrap_or_default();
                            serde_json::json!({ "key": i.key, "rv": i.resource_version, "value": value })
                        })
                        .collect();
                    let out = serde_json::json!({ "items": items, "continue": rsp.next_page_token, "rv": rsp.resource_version });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::History { gr, name, limit } => {
            let key = resource_key(ns, &gr, &name)?;
            let rsp = server.history(&ctx, HistoryRequest { key, limit, requester, ..Default::default() }).await?;
            check(rsp.error)?;
            for item in &rsp.items {
                println!("{}", item.resource_version);
            }
        }
        Commands::Watch { gr, since, initial } => {
            let key = match gr {
                Some(gr) => shard(ns, &gr)?,
                None => NamespacedResource::default(),
            };
            info!(filter = %key, since = ?since, "watch invoked");
            let req = WatchRequest { key, since_rv: since, send_initial_events: initial, requester };
            let mut handle = server.watch(&ctx, req).await?;
            let t0 = Instant::now();
            let mut seen = 0usize;
            loop {
                tokio::select! {
                    ev = handle.rx.recv() => match ev {
                        Some(ev) => {
                            seen += 1;
                            match cli.output {
                                Output::Human => {
                                    let mark = match ev.event_type {
                                        WatchEventType::Added => '+',
                                        WatchEventType::Modified => '~',
                                        WatchEventType::Deleted => '-',
                                    };
                                    println!("{} {} @{}", mark, ev.key, ev.resource_version);
                                }
                                Output::Json => {
                                    let out = serde_json::json!({
                                        "type": ev.event_type,
                                        "key": ev.key,
                                        "rv": ev.resource_version,
                                        "folder": ev.folder,
                                    });
                                    println!("{}", serde_json::to_string(&out)?);
                                }
                            }
                        }
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        info!("ctrl-c received; stopping watch");
                        break;
                    }
                }
            }
            handle.cancel.cancel();
            info!(events = seen, took_ms = %t0.elapsed().as_millis(), "watch ended");
        }
        Commands::Stats { min_count } => {
            let rsp = server.get_stats(&ctx, StatsRequest { namespace: cli.namespace.clone(), min_count }).await?;
            check(rsp.error)?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<32} {:>8} {}", "NAMESPACE", "GROUP/RESOURCE", "COUNT", "RV");
                    for s in &rsp.stats {
                        let gr = format!("{}/{}", s.group, s.resource);
                        println!("{:<16} {:<32} {:>8} {}", s.namespace, gr, s.count, s.resource_version);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rsp.stats)?),
            }
        }
        Commands::Index { gr } => {
            let key = shard(ns, &gr)?;
            let t0 = Instant::now();
            let idx = server.indexer().rebuild(&ctx, &key).await?;
            let docs = idx.doc_count(&ctx, "")?;
            let storage = if idx.is_file() { "file" } else { "memory" };
            println!("{} docs={} rv={} storage={} took_ms={}", key, docs, idx.rv(), storage, t0.elapsed().as_millis());
        }
        Commands::Search { gr, query, limit, offset, fields, sort, filters, facets, federate, explain } => {
            let mut req = SearchRequest::new(shard(ns, &gr)?);
            req.query = query;
            req.limit = limit;
            req.offset = offset;
            req.fields = fields;
            req.explain = explain;
            req.sort_by = sort.iter().map(|s| parse_sort(s)).collect();
            for f in &filters {
                let (k, v) = f.split_once('=').ok_or_else(|| anyhow!("expected key=value, got '{}'", f))?;
                match k.strip_prefix("labels.") {
                    Some(label) => req.labels.push(Requirement::equals(label, &[v])),
                    None => req.requirements.push(Requirement::equals(k, &[v])),
                }
            }
            for f in facets {
                req.facets.insert(f.clone(), FacetRequest { field: f, limit: 10 });
            }
            for g in &federate {
                req.federated.push(shard(ns, g)?);
            }
            let rsp = server.search(&ctx, req).await?;
            check(rsp.error.clone())?;
            match cli.output {
                Output::Human => {
                    let names: Vec<&str> = rsp.results.columns.iter().map(|c| c.name.as_str()).collect();
                    println!("{}", names.join("\t"));
                    for i in 0..rsp.results.rows.len() {
                        let cells = rsp.results.decode_row(i)?;
                        println!("{}", cells.iter().map(cell_text).collect::<Vec<_>>().join("\t"));
                    }
                    eprintln!("total: {}  max_score: {:.3}", rsp.total_hits, rsp.max_score);
                    for (name, facet) in &rsp.facets {
                        let terms: Vec<String> = facet.terms.iter().map(|t| format!("{}={}", t.term, t.count)).collect();
                        eprintln!("facet {}: {} (missing {})", name, terms.join(" "), facet.missing);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rsp)?),
            }
        }
        Commands::PutBlob { gr, name, file, content_type } => {
            let resource = resource_key(ns, &gr, &name)?;
            let value = read_input(&file)?;
            let rsp = server.put_blob(&ctx, PutBlobRequest { resource, content_type, value }).await?;
            check(rsp.error)?;
            println!("{}", serde_json::to_string(&rsp.blob)?);
        }
        Commands::GetBlob { gr, name, uid } => {
            let resource = resource_key(ns, &gr, &name)?;
            let rsp = server.get_blob(&ctx, GetBlobRequest { resource, uid, ..Default::default() }).await?;
            check(rsp.error)?;
            use std::io::Write;
            std::io::stdout().write_all(&rsp.value).context("write blob")?;
        }
        Commands::Managed { kind, id } => {
            let req = ListManagedObjectsRequest { namespace: cli.namespace.clone(), kind, id };
            let rsp = server.list_managed_objects(&ctx, req).await?;
            check(rsp.error)?;
            match cli.output {
                Output::Human => {
                    for o in &rsp.items {
                        println!("{:<40} {:<24} {}", o.path, o.key.name, o.hash);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rsp.items)?),
            }
        }
    }
    server.indexer().search().close();
    Ok(())
}
