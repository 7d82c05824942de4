//! VASP 5 POSCAR/CONTCAR reading and writing.
//!
//! ```text
//! Comment line (structure label)
//! 1.0                    # scale (negative: target volume in Å³)
//! a1 a2 a3
//! b1 b2 b3
//! c1 c2 c3
//! Si O                   # species
//! 2 4                    # counts
//! Selective dynamics     # optional
//! Direct                 # or Cartesian
//! x y z [T T F]
//! ```

use std::fmt::Write as _;

use nalgebra::Vector3;

use crate::core::chemistry::Element;
use crate::core::domain::{Lattice, Site, Structure};
use crate::error::{CalcError, Result};

/// Site property holding selective-dynamics flags as a `[bool; 3]` array.
pub const SELECTIVE_DYNAMICS: &str = "selective_dynamics";

const FORMAT: &str = "POSCAR";

/// Parses POSCAR text. `source_name` only appears in error messages.
pub fn parse(content: &str, source_name: &str) -> Result<Structure> {
    let err = |reason: String| CalcError::parse(FORMAT, source_name, reason);
    let mut lines = content.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));
    let mut next = |what: &str| {
        lines
            .next()
            .ok_or_else(|| err(format!("unexpected end of file, expected {}", what)))
    };

    let (_, comment) = next("comment line")?;
    let label = comment.to_string();

    let (n, scale_line) = next("scale factor")?;
    let scale: f64 = first_token(scale_line)
        .parse()
        .map_err(|_| err(format!("line {}: invalid scale factor '{}'", n, scale_line)))?;
    if scale == 0.0 || !scale.is_finite() {
        return Err(err(format!("line {}: scale factor must be non-zero", n)));
    }

    let mut rows = [[0.0; 3]; 3];
    for row in rows.iter_mut() {
        let (n, line) = next("lattice vector")?;
        let values = parse_floats(line, 3)
            .ok_or_else(|| err(format!("line {}: expected three lattice components", n)))?;
        row.copy_from_slice(&values);
    }
    let unscaled = Lattice::from_rows(rows).map_err(|e| err(e.to_string()))?;
    let factor = if scale > 0.0 {
        scale
    } else {
        (-scale / unscaled.volume()).cbrt()
    };
    let rows = rows.map(|r| r.map(|x| x * factor));
    let lattice = Lattice::from_rows(rows).map_err(|e| err(e.to_string()))?;

    let (n, species_line) = next("species line")?;
    if species_line
        .split_whitespace()
        .next()
        .map_or(true, |t| t.parse::<usize>().is_ok())
    {
        return Err(err(format!(
            "line {}: species symbols are required (VASP 4 layout is not supported)",
            n
        )));
    }
    let species = species_line
        .split_whitespace()
        .map(|s| {
            // CONTCARs from some codes write "Si_pv" or "Fe/abc123".
            let symbol = s.split(['_', '/']).next().unwrap_or(s);
            Element::from_symbol(symbol).ok_or_else(|| err(format!("line {}: unknown element '{}'", n, s)))
        })
        .collect::<Result<Vec<_>>>()?;

    let (n, counts_line) = next("species counts")?;
    let counts = counts_line
        .split_whitespace()
        .map(|t| t.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| err(format!("line {}: invalid species counts '{}'", n, counts_line)))?;
    if counts.len() != species.len() {
        return Err(err(format!(
            "line {}: {} counts for {} species",
            n,
            counts.len(),
            species.len()
        )));
    }
    let total: usize = counts.iter().sum();
    if total == 0 {
        return Err(err("structure has no atoms".to_string()));
    }

    let (mut n, mut mode) = next("coordinate mode")?;
    let selective = mode.starts_with(['s', 'S']);
    if selective {
        (n, mode) = next("coordinate mode")?;
    }
    let cartesian = match mode.chars().next() {
        Some('c' | 'C' | 'k' | 'K') => true,
        Some('d' | 'D') => false,
        _ => return Err(err(format!("line {}: unknown coordinate mode '{}'", n, mode))),
    };

    let elements = species
        .iter()
        .zip(&counts)
        .flat_map(|(&el, &count)| std::iter::repeat(el).take(count));
    let mut sites = Vec::with_capacity(total);
    for element in elements {
        let (n, line) = next("atomic position")?;
        let coords = parse_floats(line, 3)
            .ok_or_else(|| err(format!("line {}: expected three coordinates", n)))?;
        let v = Vector3::new(coords[0], coords[1], coords[2]);
        let frac = if cartesian {
            lattice.to_fractional(&(v * factor))
        } else {
            v
        };
        let mut site = Site::new(element, frac);
        if selective {
            let flags = parse_flags(line)
                .ok_or_else(|| err(format!("line {}: expected three selective-dynamics flags", n)))?;
            site.properties
                .insert(SELECTIVE_DYNAMICS.to_string(), serde_json::json!(flags));
        }
        sites.push(site);
    }

    Ok(Structure::from_sites(lattice, sites)
        .map_err(|e| err(e.to_string()))?
        .with_label(label))
}

/// Renders `structure` in direct coordinates with unit scale.
///
/// Species are written as runs in site order, so the site order is kept on
/// a round trip.
pub fn to_string(structure: &Structure) -> String {
    let mut out = String::new();
    let label = if structure.label().is_empty() {
        structure.formula()
    } else {
        structure.label().replace('\n', " ")
    };
    let _ = writeln!(out, "{}", label);
    let _ = writeln!(out, "1.0");
    let lattice = structure.lattice();
    for i in 0..3 {
        let v = lattice.vector(i);
        let _ = writeln!(out, "  {:>20.12} {:>20.12} {:>20.12}", v.x, v.y, v.z);
    }

    let mut runs: Vec<(Element, usize)> = Vec::new();
    for site in structure.sites() {
        match runs.last_mut() {
            Some((el, count)) if *el == site.element => *count += 1,
            _ => runs.push((site.element, 1)),
        }
    }
    let symbols: Vec<&str> = runs.iter().map(|(el, _)| el.symbol()).collect();
    let counts: Vec<String> = runs.iter().map(|(_, n)| n.to_string()).collect();
    let _ = writeln!(out, "  {}", symbols.join(" "));
    let _ = writeln!(out, "  {}", counts.join(" "));

    let selective = structure
        .sites()
        .iter()
        .any(|s| s.properties.contains_key(SELECTIVE_DYNAMICS));
    if selective {
        let _ = writeln!(out, "Selective dynamics");
    }
    let _ = writeln!(out, "Direct");
    for site in structure.sites() {
        let f = site.frac;
        let _ = write!(out, "  {:>18.12} {:>18.12} {:>18.12}", f.x, f.y, f.z);
        if selective {
            let flags = site
                .properties
                .get(SELECTIVE_DYNAMICS)
                .and_then(|v| serde_json::from_value::<[bool; 3]>(v.clone()).ok())
                .unwrap_or([true; 3]);
            for flag in flags {
                out.push_str(if flag { " T" } else { " F" });
            }
        }
        out.push('\n');
    }
    out
}

fn first_token(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

fn parse_floats(line: &str, n: usize) -> Option<Vec<f64>> {
    let values: Vec<f64> = line
        .split_whitespace()
        .take(n)
        .map(|t| t.parse().ok())
        .collect::<Option<_>>()?;
    (values.len() == n && values.iter().all(|x| x.is_finite())).then_some(values)
}

fn parse_flags(line: &str) -> Option<[bool; 3]> {
    let mut flags = line.split_whitespace().skip(3).map(|t| match t {
        "T" | "t" => Some(true),
        "F" | "f" => Some(false),
        _ => None,
    });
    Some([flags.next()??, flags.next()??, flags.next()??])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const NACL: &str = "rocksalt NaCl
5.64
 1.0 0.0 0.0
 0.0 1.0 0.0
 0.0 0.0 1.0
Na Cl
1 1
Direct
 0.0 0.0 0.0
 0.5 0.5 0.5
";

    #[test]
    fn parses_direct_coordinates_with_scale() {
        let s = parse(NACL, "NaCl.vasp").unwrap();
        assert_eq!(s.label(), "rocksalt NaCl");
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s.volume(), 5.64f64.powi(3), epsilon = 1e-9);
        assert_eq!(s.sites()[1].element.symbol(), "Cl");
        assert_relative_eq!(s.sites()[1].frac.x, 0.5);
    }

    #[test]
    fn negative_scale_is_target_volume() {
        let text = NACL.replace("5.64", "-64.0");
        let s = parse(&text, "vol").unwrap();
        assert_relative_eq!(s.volume(), 64.0, epsilon = 1e-9);
    }

    #[test]
    fn cartesian_and_selective_dynamics() {
        let text = "Si2
1.0
 4.0 0.0 0.0
 0.0 4.0 0.0
 0.0 0.0 4.0
Si_pv
2
Selective dynamics
Cartesian
 0.0 0.0 0.0 T T T
 1.0 2.0 3.0 F F T
";
        let s = parse(text, "CONTCAR").unwrap();
        assert_relative_eq!(s.sites()[1].frac.z, 0.75);
        assert_eq!(
            s.sites()[1].properties[SELECTIVE_DYNAMICS],
            serde_json::json!([false, false, true])
        );
        let again = parse(&to_string(&s), "again").unwrap();
        assert_eq!(again.sites()[1].properties, s.sites()[1].properties);
    }

    #[test]
    fn malformed_inputs_are_parse_errors() {
        let cases = [
            (String::new(), "end of file"),
            (NACL.replace("5.64", "abc"), "scale"),
            (NACL.replace("Na Cl", "1 1"), "species symbols"),
            (NACL.replace("Na Cl", "Na Xx"), "unknown element"),
            (NACL.replace("1 1", "1"), "counts for"),
            (NACL.replace("Direct", "Weird"), "coordinate mode"),
            (NACL.replace(" 0.5 0.5 0.5\n", ""), "end of file"),
        ];
        for (text, needle) in cases {
            match parse(&text, "bad") {
                Err(CalcError::Parse { reason, .. }) => {
                    assert!(reason.contains(needle), "'{}' does not mention '{}'", reason, needle)
                }
                other => panic!("expected parse error for '{}', got {:?}", needle, other),
            }
        }
    }

    #[test]
    fn writer_keeps_site_order_with_repeated_species() {
        let lattice = Lattice::cubic(3.0).unwrap();
        let (o, h) = (Element::from_symbol("O").unwrap(), Element::from_symbol("H").unwrap());
        let s = Structure::new(
            lattice,
            vec![o, h, o],
            vec![Vector3::zeros(), Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.5, 0.5, 0.5)],
        )
        .unwrap();
        let text = to_string(&s);
        assert!(text.contains("O H O"));
        let back = parse(&text, "w").unwrap();
        assert_eq!(back.elements(), s.elements());
        assert_relative_eq!(back.sites()[1].frac.y, 0.2, epsilon = 1e-10);
    }
}
