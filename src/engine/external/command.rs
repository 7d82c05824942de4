use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::Structure;
use crate::engine::potential::{Evaluation, Potential};
use crate::error::{CalcError, Result};

/// Wraps an external executable (typically a thin script around an ML force
/// field) as a potential. Streams input/output via pipes to avoid disk latency.
///
/// Protocol: one JSON document on stdin
/// `{"lattice": [[..],[..],[..]], "symbols": [..], "positions": [[..], ..]}`
/// (rows are lattice vectors, positions are cartesian Å), one JSON document on
/// stdout `{"energy": e, "forces": [[..], ..], "stress": [[..],[..],[..]]}`.
/// Stress may also be given as a Voigt 6-vector. A top-level `"error"` string
/// reports a structure the model cannot handle.
#[derive(Debug, Clone)]
pub struct CommandPotential {
    name: String,
    executable: PathBuf,
    args: Vec<String>,
}

#[derive(Serialize)]
struct CommandInput<'a> {
    lattice: [[f64; 3]; 3],
    symbols: Vec<&'a str>,
    positions: Vec<[f64; 3]>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StressRepr {
    Full([[f64; 3]; 3]),
    Voigt([f64; 6]),
}

#[derive(Deserialize)]
struct CommandOutput {
    #[serde(default)]
    error: Option<String>,
    energy: Option<f64>,
    #[serde(default)]
    forces: Vec<[f64; 3]>,
    stress: Option<StressRepr>,
}

impl CommandPotential {
    /// Creates a new command potential.
    ///
    /// # Arguments
    /// * `name` - Name reported by `Potential::name`.
    /// * `executable` - Program path, or a bare name looked up on `PATH`.
    /// * `args` - Extra arguments passed on every call.
    pub fn new(name: &str, executable: &str, args: Vec<String>) -> Result<Self> {
        let resolved = resolve_executable(executable).ok_or_else(|| {
            CalcError::Configuration(format!(
                "executable '{}' for potential '{}' not found",
                executable, name
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            executable: resolved,
            args,
        })
    }

    /// Constructs the JSON document sent to the executable.
    fn generate_input(&self, structure: &Structure) -> Result<String> {
        let m = structure.lattice().vectors();
        let input = CommandInput {
            lattice: [
                [m[(0, 0)], m[(1, 0)], m[(2, 0)]],
                [m[(0, 1)], m[(1, 1)], m[(2, 1)]],
                [m[(0, 2)], m[(1, 2)], m[(2, 2)]],
            ],
            symbols: structure.sites().iter().map(|s| s.element.symbol()).collect(),
            positions: structure
                .cart_positions()
                .iter()
                .map(|r| [r.x, r.y, r.z])
                .collect(),
        };
        serde_json::to_string(&input)
            .map_err(|e| CalcError::evaluation(&self.name, format!("failed to encode input: {}", e)))
    }

    /// Executes the command via stdin/stdout piping.
    fn run_process(&self, input_data: &str) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CalcError::evaluation(&self.name, format!("failed to spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(input_data.as_bytes()) {
                // Reap the child so a backend that stopped reading is not left behind.
                let _ = child.kill();
                let _ = child.wait();
                return Err(CalcError::evaluation(&self.name, format!("failed to write stdin: {}", e)));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| CalcError::evaluation(&self.name, format!("failed to read output: {}", e)))?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            return Err(CalcError::evaluation(
                &self.name,
                format!("exited with {}: {}", output.status, err_msg.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_output(&self, output: &str) -> Result<Evaluation> {
        let parsed: CommandOutput = serde_json::from_str(output.trim())
            .map_err(|e| CalcError::evaluation(&self.name, format!("malformed output: {}", e)))?;

        if let Some(reason) = parsed.error {
            return Err(CalcError::evaluation(&self.name, reason));
        }

        let energy = parsed
            .energy
            .ok_or_else(|| CalcError::evaluation(&self.name, "output has no energy"))?;

        let stress = match parsed.stress {
            Some(StressRepr::Full(rows)) => Matrix3::from_fn(|i, j| rows[i][j]),
            Some(StressRepr::Voigt([xx, yy, zz, yz, xz, xy])) => {
                Matrix3::new(xx, xy, xz, xy, yy, yz, xz, yz, zz)
            }
            None => return Err(CalcError::evaluation(&self.name, "output has no stress")),
        };

        Ok(Evaluation {
            energy,
            forces: parsed.forces.iter().map(|f| Vector3::from(*f)).collect(),
            stress,
        })
    }
}

impl Potential for CommandPotential {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        let input_str = self.generate_input(structure)?;
        let output_str = self.run_process(&input_str)?;
        self.parse_output(&output_str)?
            .validated(&self.name, structure)
    }
}

/// Finds `program` either as a path or on `PATH`.
fn resolve_executable(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::chemistry::Element;
    use crate::core::domain::Lattice;

    fn dimer() -> Structure {
        let h = Element::from_symbol("H").unwrap();
        Structure::new(
            Lattice::cubic(10.0).unwrap(),
            vec![h, h],
            vec![Vector3::zeros(), Vector3::new(0.074, 0.0, 0.0)],
        )
        .unwrap()
    }

    fn shell(script: &str) -> CommandPotential {
        CommandPotential::new("scripted", "sh", vec!["-c".to_string(), script.to_string()]).unwrap()
    }

    #[test]
    fn missing_executable_is_a_configuration_error() {
        let err = CommandPotential::new("ml", "definitely-not-a-real-binary-xyz", vec![]).unwrap_err();
        assert!(matches!(err, CalcError::Configuration(_)));
    }

    #[test]
    fn reads_voigt_stress_and_forces() {
        let pot = shell(
            r#"cat > /dev/null; echo '{"energy": -1.5, "forces": [[0.1,0,0],[-0.1,0,0]], "stress": [0.01,0.01,0.01,0,0,0.002]}'"#,
        );
        let eval = pot.evaluate(&dimer()).unwrap();
        assert_eq!(eval.energy, -1.5);
        assert_eq!(eval.forces.len(), 2);
        assert_eq!(eval.stress[(0, 1)], 0.002);
        assert_eq!(eval.stress[(1, 0)], 0.002);
    }

    #[test]
    fn reported_errors_become_evaluation_errors() {
        let pot = shell(r#"cat > /dev/null; echo '{"error": "element H not in training set"}'"#);
        let err = pot.evaluate(&dimer()).unwrap_err();
        assert!(matches!(err, CalcError::Evaluation { .. }));
        assert!(err.to_string().contains("training set"));
    }

    #[test]
    fn force_count_mismatch_is_rejected() {
        let pot = shell(
            r#"cat > /dev/null; echo '{"energy": 0.0, "forces": [[0,0,0]], "stress": [[0,0,0],[0,0,0],[0,0,0]]}'"#,
        );
        assert!(matches!(pot.evaluate(&dimer()), Err(CalcError::Evaluation { .. })));
    }

    #[test]
    fn backend_that_closes_stdin_is_killed() {
        let h = Element::from_symbol("H").unwrap();
        let n = 4000;
        let frac: Vec<_> = (0..n).map(|i| Vector3::new(i as f64 / n as f64, 0.5, 0.5)).collect();
        let big = Structure::new(Lattice::cubic(50.0).unwrap(), vec![h; n], frac).unwrap();

        let pot = shell("exec 0<&-; sleep 30");
        let start = std::time::Instant::now();
        let err = pot.evaluate(&big).unwrap_err();
        assert!(matches!(err, CalcError::Evaluation { .. }));
        assert!(err.to_string().contains("failed to write stdin"), "{}", err);
        assert!(start.elapsed().as_secs() < 10);
    }

    #[test]
    fn non_zero_exit_is_reported() {
        let pot = shell("cat > /dev/null; echo boom >&2; exit 3");
        let err = pot.evaluate(&dimer()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
