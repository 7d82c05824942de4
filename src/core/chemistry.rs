use std::fmt;

use serde::{Deserialize, Serialize};

/// (symbol, standard atomic weight in amu), indexed by atomic number - 1.
const ELEMENTS: [(&str, f64); 94] = [
    ("H", 1.008), ("He", 4.0026), ("Li", 6.94), ("Be", 9.0122), ("B", 10.81),
    ("C", 12.011), ("N", 14.007), ("O", 15.999), ("F", 18.998), ("Ne", 20.180),
    ("Na", 22.990), ("Mg", 24.305), ("Al", 26.982), ("Si", 28.085), ("P", 30.974),
    ("S", 32.06), ("Cl", 35.45), ("Ar", 39.948), ("K", 39.098), ("Ca", 40.078),
    ("Sc", 44.956), ("Ti", 47.867), ("V", 50.942), ("Cr", 51.996), ("Mn", 54.938),
    ("Fe", 55.845), ("Co", 58.933), ("Ni", 58.693), ("Cu", 63.546), ("Zn", 65.38),
    ("Ga", 69.723), ("Ge", 72.630), ("As", 74.922), ("Se", 78.971), ("Br", 79.904),
    ("Kr", 83.798), ("Rb", 85.468), ("Sr", 87.62), ("Y", 88.906), ("Zr", 91.224),
    ("Nb", 92.906), ("Mo", 95.95), ("Tc", 97.0), ("Ru", 101.07), ("Rh", 102.91),
    ("Pd", 106.42), ("Ag", 107.87), ("Cd", 112.41), ("In", 114.82), ("Sn", 118.71),
    ("Sb", 121.76), ("Te", 127.60), ("I", 126.90), ("Xe", 131.29), ("Cs", 132.91),
    ("Ba", 137.33), ("La", 138.91), ("Ce", 140.12), ("Pr", 140.91), ("Nd", 144.24),
    ("Pm", 145.0), ("Sm", 150.36), ("Eu", 151.96), ("Gd", 157.25), ("Tb", 158.93),
    ("Dy", 162.50), ("Ho", 164.93), ("Er", 167.26), ("Tm", 168.93), ("Yb", 173.05),
    ("Lu", 174.97), ("Hf", 178.49), ("Ta", 180.95), ("W", 183.84), ("Re", 186.21),
    ("Os", 190.23), ("Ir", 192.22), ("Pt", 195.08), ("Au", 196.97), ("Hg", 200.59),
    ("Tl", 204.38), ("Pb", 207.2), ("Bi", 208.98), ("Po", 209.0), ("At", 210.0),
    ("Rn", 222.0), ("Fr", 223.0), ("Ra", 226.0), ("Ac", 227.0), ("Th", 232.04),
    ("Pa", 231.04), ("U", 238.03), ("Np", 237.0), ("Pu", 244.0),
];

/// A chemical element, stored as its atomic number.
///
/// Serialized as the element symbol so structure files stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Element(u8);

impl Element {
    pub fn from_atomic_number(z: u8) -> Option<Self> {
        if z >= 1 && (z as usize) <= ELEMENTS.len() {
            Some(Element(z))
        } else {
            None
        }
    }

    /// Case-insensitive symbol lookup ("fe", "Fe" and "FE" are all iron).
    /// Trailing oxidation-state or label suffixes such as "Fe2+" or "O1" are ignored.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let letters: String = symbol
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        if letters.is_empty() {
            return None;
        }
        ELEMENTS
            .iter()
            .position(|(s, _)| s.eq_ignore_ascii_case(&letters))
            .map(|i| Element(i as u8 + 1))
    }

    pub fn atomic_number(&self) -> u8 {
        self.0
    }

    pub fn symbol(&self) -> &'static str {
        ELEMENTS[self.0 as usize - 1].0
    }

    /// Standard atomic weight (amu).
    pub fn mass(&self) -> f64 {
        ELEMENTS[self.0 as usize - 1].1
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl TryFrom<String> for Element {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Element::from_symbol(&value).ok_or_else(|| format!("unknown element symbol '{}'", value))
    }
}

impl From<Element> for String {
    fn from(e: Element) -> Self {
        e.symbol().to_string()
    }
}

/// A flattened symmetric table of per-pair parameters.
/// Access is O(1) via `index = i * N + j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionGrid<P> {
    elements: Vec<Element>,
    table: Vec<P>,
}

impl<P: Clone> InteractionGrid<P> {
    /// Builds the grid by combining per-element parameters with `mix`.
    pub fn from_mixing<E, F>(per_element: &[(Element, E)], mix: F) -> Self
    where
        F: Fn(&E, &E) -> P,
    {
        let n = per_element.len();
        let mut table = Vec::with_capacity(n * n);
        for (_, pi) in per_element {
            for (_, pj) in per_element {
                table.push(mix(pi, pj));
            }
        }
        Self {
            elements: per_element.iter().map(|(e, _)| *e).collect(),
            table,
        }
    }

    /// Index of an element in the grid, `None` if the grid has no parameters for it.
    pub fn index_of(&self, element: Element) -> Option<usize> {
        self.elements.iter().position(|&e| e == element)
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    #[inline(always)]
    pub fn get(&self, id_a: usize, id_b: usize) -> &P {
        &self.table[id_a * self.elements.len() + id_b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_lookup_ignores_case_and_suffixes() {
        let fe = Element::from_symbol("Fe").unwrap();
        assert_eq!(fe.atomic_number(), 26);
        assert_eq!(Element::from_symbol("fe"), Some(fe));
        assert_eq!(Element::from_symbol("Fe3+"), Some(fe));
        assert_eq!(Element::from_symbol("Xx"), None);
        assert_eq!(Element::from_symbol(""), None);
    }

    #[test]
    fn masses_follow_atomic_number() {
        let ar = Element::from_atomic_number(18).unwrap();
        assert_eq!(ar.symbol(), "Ar");
        assert!((ar.mass() - 39.948).abs() < 1e-9);
        assert!(Element::from_atomic_number(0).is_none());
        assert!(Element::from_atomic_number(200).is_none());
    }

    #[test]
    fn element_serializes_as_symbol() {
        let si = Element::from_symbol("Si").unwrap();
        let json = serde_json::to_string(&si).unwrap();
        assert_eq!(json, "\"Si\"");
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(back, si);
        assert!(serde_json::from_str::<Element>("\"Qq\"").is_err());
    }

    #[test]
    fn grid_mixes_pairs() {
        let a = Element::from_symbol("Ar").unwrap();
        let b = Element::from_symbol("Kr").unwrap();
        let grid = InteractionGrid::from_mixing(&[(a, 2.0), (b, 4.0)], |x: &f64, y: &f64| x + y);
        let ia = grid.index_of(a).unwrap();
        let ib = grid.index_of(b).unwrap();
        assert_eq!(*grid.get(ia, ia), 4.0);
        assert_eq!(*grid.get(ia, ib), 6.0);
        assert_eq!(*grid.get(ib, ib), 8.0);
        assert!(grid.index_of(Element::from_symbol("Ne").unwrap()).is_none());
    }
}
