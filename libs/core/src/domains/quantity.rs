//! Kubernetes `Quantity` parsing and formatting shared by every builder
//! that aggregates container resource requests/limits. Kept standalone
//! (rather than inlined per-builder) since both cluster-overview and
//! namespace-workloads need the same cpu/memory arithmetic.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_MEM_SUFFIXES: &[(&str, i64)] = &[
    ("Ei", 1i64 << 60),
    ("Pi", 1i64 << 50),
    ("Ti", 1i64 << 40),
    ("Gi", 1i64 << 30),
    ("Mi", 1i64 << 20),
    ("Ki", 1i64 << 10),
];

const DECIMAL_MEM_SUFFIXES: &[(&str, i64)] = &[
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parses a CPU quantity (`"100m"`, `"0.5"`, `"2"`) into millicores.
pub fn parse_cpu_millis(q: &Quantity) -> i64 {
    let s = q.0.trim();
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped.trim().parse::<f64>().unwrap_or(0.0).round() as i64;
    }
    if let Some(stripped) = s.strip_suffix('n') {
        return (stripped.trim().parse::<f64>().unwrap_or(0.0) / 1_000_000.0).round() as i64;
    }
    if let Some(stripped) = s.strip_suffix('u') {
        return (stripped.trim().parse::<f64>().unwrap_or(0.0) / 1_000.0).round() as i64;
    }
    (s.parse::<f64>().unwrap_or(0.0) * 1000.0).round() as i64
}

/// Parses a memory quantity (`"64Mi"`, `"128974848"`, `"1Gi"`) into bytes.
pub fn parse_mem_bytes(q: &Quantity) -> i64 {
    let s = q.0.trim();
    for (suffix, multiplier) in BINARY_MEM_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            return (stripped.trim().parse::<f64>().unwrap_or(0.0) * (*multiplier as f64)).round() as i64;
        }
    }
    for (suffix, multiplier) in DECIMAL_MEM_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            return (stripped.trim().parse::<f64>().unwrap_or(0.0) * (*multiplier as f64)).round() as i64;
        }
    }
    s.parse::<f64>().unwrap_or(0.0).round() as i64
}

/// Formats millicores back into kubectl-style notation: whole cores drop
/// the `m` suffix, everything else keeps it.
pub fn format_cpu_millis(millis: i64) -> String {
    if millis != 0 && millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{millis}m")
    }
}

/// Formats bytes back into the largest binary unit that divides evenly,
/// falling back to a plain byte count.
pub fn format_mem_bytes(bytes: i64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, multiplier) in BINARY_MEM_SUFFIXES {
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}

/// CPU/memory request/limit totals for one pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodResourceTotals {
    pub cpu_request_millis: i64,
    pub cpu_limit_millis: i64,
    pub mem_request_bytes: i64,
    pub mem_limit_bytes: i64,
}

fn container_quantities(container: &Container) -> PodResourceTotals {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());
    PodResourceTotals {
        cpu_request_millis: requests.and_then(|m| m.get("cpu")).map(parse_cpu_millis).unwrap_or(0),
        cpu_limit_millis: limits.and_then(|m| m.get("cpu")).map(parse_cpu_millis).unwrap_or(0),
        mem_request_bytes: requests.and_then(|m| m.get("memory")).map(parse_mem_bytes).unwrap_or(0),
        mem_limit_bytes: limits.and_then(|m| m.get("memory")).map(parse_mem_bytes).unwrap_or(0),
    }
}

fn sum_containers(containers: &[Container]) -> PodResourceTotals {
    containers.iter().map(container_quantities).fold(PodResourceTotals::default(), |acc, c| PodResourceTotals {
        cpu_request_millis: acc.cpu_request_millis + c.cpu_request_millis,
        cpu_limit_millis: acc.cpu_limit_millis + c.cpu_limit_millis,
        mem_request_bytes: acc.mem_request_bytes + c.mem_request_bytes,
        mem_limit_bytes: acc.mem_limit_bytes + c.mem_limit_bytes,
    })
}

fn max_containers(containers: &[Container]) -> PodResourceTotals {
    containers.iter().map(container_quantities).fold(PodResourceTotals::default(), |acc, c| PodResourceTotals {
        cpu_request_millis: acc.cpu_request_millis.max(c.cpu_request_millis),
        cpu_limit_millis: acc.cpu_limit_millis.max(c.cpu_limit_millis),
        mem_request_bytes: acc.mem_request_bytes.max(c.mem_request_bytes),
        mem_limit_bytes: acc.mem_limit_bytes.max(c.mem_limit_bytes),
    })
}

/// Pod-level resource aggregation: containers sum, init containers take the
/// max across inits, and the pod total is `max(sum_containers, max_inits)`
/// per field — a pod only ever runs its inits sequentially before its
/// regular containers, so the peak usage is whichever phase demands more.
pub fn aggregate_pod_resources(spec: &k8s_openapi::api::core::v1::PodSpec) -> PodResourceTotals {
    let sums = sum_containers(&spec.containers);
    let inits = spec
        .init_containers
        .as_deref()
        .map(max_containers)
        .unwrap_or_default();

    PodResourceTotals {
        cpu_request_millis: sums.cpu_request_millis.max(inits.cpu_request_millis),
        cpu_limit_millis: sums.cpu_limit_millis.max(inits.cpu_limit_millis),
        mem_request_bytes: sums.mem_request_bytes.max(inits.mem_request_bytes),
        mem_limit_bytes: sums.mem_limit_bytes.max(inits.mem_limit_bytes),
    }
}
