//! Named potentials, their aliases, and the per-process cache of loaded handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::info;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::Element;
use crate::engine::external::CommandPotential;
use crate::engine::potential::Potential;
use crate::engine::potentials::{LennardJones, Morse, PairFunction, PairPotential, ZeroPotential};
use crate::error::{CalcError, Result};

/// Full description of a potential, as written in job files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PotentialSpec {
    LennardJones {
        #[serde(default)]
        name: Option<String>,
        epsilon: f64,
        sigma: f64,
        cutoff: f64,
        /// Supported elements; empty means any element.
        #[serde(default)]
        elements: Vec<String>,
        #[serde(default)]
        max_atoms: Option<usize>,
    },
    Morse {
        #[serde(default)]
        name: Option<String>,
        d0: f64,
        alpha: f64,
        r0: f64,
        cutoff: f64,
        #[serde(default)]
        elements: Vec<String>,
        #[serde(default)]
        max_atoms: Option<usize>,
    },
    Zero,
    Command {
        name: String,
        executable: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl PotentialSpec {
    /// Instantiates a fresh, unshared potential.
    pub fn build(&self) -> Result<Box<dyn Potential>> {
        match self {
            PotentialSpec::LennardJones { name, epsilon, sigma, cutoff, elements, max_atoms } => {
                let f = LennardJones { epsilon: *epsilon, sigma: *sigma };
                pair_potential(name.as_deref().unwrap_or("LJ"), f, *cutoff, elements, *max_atoms)
            }
            PotentialSpec::Morse { name, d0, alpha, r0, cutoff, elements, max_atoms } => {
                let f = Morse { d0: *d0, alpha: *alpha, r0: *r0 };
                pair_potential(name.as_deref().unwrap_or("Morse"), f, *cutoff, elements, *max_atoms)
            }
            PotentialSpec::Zero => Ok(Box::new(ZeroPotential)),
            PotentialSpec::Command { name, executable, args } => {
                Ok(Box::new(CommandPotential::new(name, executable, args.clone())?))
            }
        }
    }
}

fn pair_potential<F: PairFunction + 'static>(
    name: &str,
    function: F,
    cutoff: f64,
    elements: &[String],
    max_atoms: Option<usize>,
) -> Result<Box<dyn Potential>> {
    let mut pot = if elements.is_empty() {
        PairPotential::uniform(name, function, cutoff)?
    } else {
        let per_element = elements
            .iter()
            .map(|sym| {
                Element::from_symbol(sym)
                    .map(|e| (e, function.clone()))
                    .ok_or_else(|| CalcError::Configuration(format!("unknown element '{}'", sym)))
            })
            .collect::<Result<Vec<_>>>()?;
        PairPotential::per_element(name, &per_element, cutoff)?
    };
    if let Some(max) = max_atoms {
        pot = pot.with_max_atoms(max);
    }
    Ok(Box::new(pot))
}

type PotentialCreator = fn() -> PotentialSpec;

static REGISTERED_POTENTIALS: Lazy<BTreeMap<&'static str, PotentialCreator>> = Lazy::new(|| {
    let mut map: BTreeMap<&'static str, PotentialCreator> = BTreeMap::new();
    map.insert("LJ-Ar", || PotentialSpec::LennardJones {
        name: Some("LJ-Ar".to_string()),
        epsilon: 0.0104,
        sigma: 3.40,
        cutoff: 8.5,
        elements: vec!["Ar".to_string()],
        max_atoms: None,
    });
    map.insert("LJ-Kr", || PotentialSpec::LennardJones {
        name: Some("LJ-Kr".to_string()),
        epsilon: 0.0140,
        sigma: 3.65,
        cutoff: 9.1,
        elements: vec!["Kr".to_string()],
        max_atoms: None,
    });
    // Girifalco & Weizer
    map.insert("Morse-Cu", || PotentialSpec::Morse {
        name: Some("Morse-Cu".to_string()),
        d0: 0.3429,
        alpha: 1.3588,
        r0: 2.866,
        cutoff: 6.5,
        elements: vec!["Cu".to_string()],
        max_atoms: None,
    });
    map.insert("Zero", || PotentialSpec::Zero);
    map
});

/// Lower-case alias -> canonical name. Canonical names match case-insensitively too.
static ALIASES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("default", "LJ-Ar"),
        ("lj", "LJ-Ar"),
        ("lennard-jones", "LJ-Ar"),
        ("argon", "LJ-Ar"),
        ("krypton", "LJ-Kr"),
        ("morse", "Morse-Cu"),
        ("copper", "Morse-Cu"),
        ("none", "Zero"),
        ("null", "Zero"),
    ])
});

static LOADED: Lazy<Mutex<HashMap<String, Arc<dyn Potential>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolves a name or alias to its canonical registered name.
pub fn resolve_name(name: &str) -> Result<&'static str> {
    let key = name.trim().to_ascii_lowercase();
    if let Some(&canonical) = ALIASES.get(key.as_str()) {
        return Ok(canonical);
    }
    REGISTERED_POTENTIALS
        .keys()
        .find(|k| k.to_ascii_lowercase() == key)
        .copied()
        .ok_or_else(|| {
            CalcError::Configuration(format!(
                "unknown potential '{}' (available: {})",
                name,
                REGISTERED_POTENTIALS.keys().copied().collect::<Vec<_>>().join(", ")
            ))
        })
}

/// `PotentialSpec` registered under `name` (or one of its aliases).
pub fn spec_for(name: &str) -> Result<PotentialSpec> {
    let canonical = resolve_name(name)?;
    Ok(REGISTERED_POTENTIALS[canonical]())
}

/// Registered names with their aliases, for listings.
pub fn available() -> Vec<(&'static str, Vec<&'static str>)> {
    REGISTERED_POTENTIALS
        .keys()
        .map(|&name| {
            let aliases = ALIASES
                .iter()
                .filter(|&(_, &target)| target == name)
                .map(|(&alias, _)| alias)
                .collect();
            (name, aliases)
        })
        .collect()
}

/// Loads a named potential once per process; later calls share the handle.
pub fn load(name: &str) -> Result<Arc<dyn Potential>> {
    let canonical = resolve_name(name)?;
    load_cached(canonical, || REGISTERED_POTENTIALS[canonical]())
}

/// Loads an explicit spec, cached by its serialized form.
pub fn load_spec(spec: &PotentialSpec) -> Result<Arc<dyn Potential>> {
    let key = serde_json::to_string(spec)
        .map_err(|e| CalcError::Configuration(format!("unserializable potential spec: {}", e)))?;
    load_cached(&key, || spec.clone())
}

fn load_cached(key: &str, spec: impl FnOnce() -> PotentialSpec) -> Result<Arc<dyn Potential>> {
    let mut loaded = LOADED.lock();
    if let Some(existing) = loaded.get(key) {
        return Ok(Arc::clone(existing));
    }
    let potential: Arc<dyn Potential> = Arc::from(spec().build()?);
    info!("Loaded potential '{}'", potential.name());
    loaded.insert(key.to_string(), Arc::clone(&potential));
    Ok(potential)
}

/// A potential given either by registered name or by full spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PotentialRef {
    Named(String),
    Spec(PotentialSpec),
}

impl Default for PotentialRef {
    fn default() -> Self {
        PotentialRef::Named("default".to_string())
    }
}

impl PotentialRef {
    pub fn to_spec(&self) -> Result<PotentialSpec> {
        match self {
            PotentialRef::Named(name) => spec_for(name),
            PotentialRef::Spec(spec) => Ok(spec.clone()),
        }
    }

    /// Shared, cached handle.
    pub fn load(&self) -> Result<Arc<dyn Potential>> {
        match self {
            PotentialRef::Named(name) => load(name),
            PotentialRef::Spec(spec) => load_spec(spec),
        }
    }

    /// Factory building a fresh instance per call, for batch workers.
    pub fn factory(&self) -> Result<impl Fn() -> Result<Box<dyn Potential>> + Send + Sync> {
        let spec = self.to_spec()?;
        Ok(move || spec.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(resolve_name("LJ").unwrap(), "LJ-Ar");
        assert_eq!(resolve_name("lj-ar").unwrap(), "LJ-Ar");
        assert_eq!(resolve_name(" Morse ").unwrap(), "Morse-Cu");
        assert_eq!(resolve_name("zero").unwrap(), "Zero");
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        let err = resolve_name("TensorNet-MatPES").unwrap_err();
        assert!(matches!(err, CalcError::Configuration(_)));
        assert!(err.to_string().contains("LJ-Ar"));
    }

    #[test]
    fn loading_is_cached_per_process() {
        let a = load("argon").unwrap();
        let b = load("LJ-Ar").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "LJ-Ar");
    }

    #[test]
    fn factory_builds_independent_instances() {
        let factory = PotentialRef::Named("zero".into()).factory().unwrap();
        let p1 = factory().unwrap();
        let p2 = factory().unwrap();
        assert_eq!(p1.name(), p2.name());
    }

    #[test]
    fn specs_deserialize_from_json() {
        let json = r#"{"kind": "lennard_jones", "epsilon": 0.01, "sigma": 3.4, "cutoff": 8.0, "elements": ["Ar"]}"#;
        let pref: PotentialRef = serde_json::from_str(json).unwrap();
        assert!(matches!(pref, PotentialRef::Spec(PotentialSpec::LennardJones { .. })));
        let named: PotentialRef = serde_json::from_str("\"lj\"").unwrap();
        assert_eq!(named, PotentialRef::Named("lj".into()));

        let bad = PotentialSpec::LennardJones {
            name: None,
            epsilon: 0.01,
            sigma: 3.4,
            cutoff: 8.0,
            elements: vec!["Qq".into()],
            max_atoms: None,
        };
        assert!(matches!(bad.build(), Err(CalcError::Configuration(_))));
    }

    #[test]
    fn every_registered_potential_builds() {
        for (name, _) in available() {
            assert!(spec_for(name).unwrap().build().is_ok(), "{} failed to build", name);
        }
    }
}
