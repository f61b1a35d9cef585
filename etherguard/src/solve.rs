//! Offline shortest-path solver.
//!
//! Reads a whitespace weight matrix (first line lists the vertex labels,
//! `Inf` marks a missing edge), runs one APSP pass, and prints the combined
//! tables as YAML followed by a human-readable path listing.

use anyhow::{Context, Result};
use etherguard_core::graph::{next_hop, path, Fullroute, Graph, GraphRecalculateSetting};
use etherguard_core::types::{Vertex, INFINITY};
use std::fs;
use std::path::Path;

pub fn print_example() {
    println!(
        "X 1   2   3   4   5   6
1 0   0.5 Inf Inf Inf Inf
2 0.5 0   0.5 0.5 Inf Inf
3 Inf 0.5 0   0.5 0.5 Inf
4 Inf 0.5 0.5 0   Inf 0.5
5 Inf Inf 0.5 Inf 0   Inf
6 Inf Inf Inf 0.5 Inf 0"
    );
}

fn parse_weight(s: &str) -> Result<f64> {
    if s == "Inf" {
        return Ok(INFINITY);
    }
    s.parse().with_context(|| format!("bad weight '{s}'"))
}

fn parse_vertex(s: &str) -> Result<Vertex> {
    let id: u16 = s.parse().with_context(|| format!("bad vertex '{s}'"))?;
    Ok(Vertex(id))
}

pub fn run(file: &Path) -> Result<()> {
    let input =
        fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let mut lines = input.lines();
    let header = lines.next().context("empty input")?;
    let verts: Vec<Vertex> = header
        .split_whitespace()
        .skip(1)
        .map(parse_vertex)
        .collect::<Result<_>>()?;

    let setting = GraphRecalculateSetting {
        static_mode: false,
        jitter_tolerance: 0.0,
        jitter_tolerance_multiplier: 1.0,
        node_report_timeout: 9999.0,
        timeout_check_interval: 9999.0,
        recalculate_cool_down: 0.0,
    };
    let graph = Graph::new(false, &setting);

    for line in lines {
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else { continue };
        let src = parse_vertex(first)?;
        for (i, field) in fields.enumerate() {
            let dst = *verts
                .get(i)
                .with_context(|| format!("row {src} has more columns than the header"))?;
            let weight = parse_weight(field)?;
            if src != dst && weight != INFINITY {
                graph.update_latency(src, dst, weight, 0.0, false, false);
            }
        }
    }

    let tables = match graph.floyd_warshall() {
        Ok(tables) => tables,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(());
        }
    };

    let fullroute = Fullroute {
        next: tables.next.clone(),
        dist: tables.dist.clone(),
    };
    print!("{}", serde_yaml::to_string(&fullroute)?);

    println!("\nHuman readable:");
    println!("src\tdist\t\tpath");
    for &u in &verts {
        for &v in &verts {
            if u != v && next_hop(&tables, u, v).is_some() {
                let hops: Vec<String> = path(&tables, u, v)
                    .iter()
                    .map(|h| h.to_string())
                    .collect();
                println!(
                    "{} -> {}\t{:.6}\t[{}]",
                    u,
                    v,
                    tables.dist[&u][&v],
                    hops.join(" ")
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight() {
        assert_eq!(parse_weight("Inf").unwrap(), INFINITY);
        assert_eq!(parse_weight("0.5").unwrap(), 0.5);
        assert!(parse_weight("x").is_err());
    }

    #[test]
    fn test_solve_example_matrix() {
        let dir = std::env::temp_dir().join("eg-solve-test");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("matrix.txt");
        std::fs::write(
            &file,
            "X 1 2 3\n1 0 0.5 Inf\n2 0.5 0 0.5\n3 Inf 0.5 0\n",
        )
        .unwrap();
        run(&file).unwrap();
        std::fs::remove_file(&file).unwrap();
    }
}
