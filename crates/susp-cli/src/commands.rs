//! Subcommand implementations

use std::error::Error;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::info;

use susp_core::{Assembly, Element, Project};
use susp_solver::{
    ConstraintsOptions, ElementForces, KinematicsSolver, SkidpadConfig, SkidpadSolver, SolveOutcome,
    SolverConfig, skidpad_options,
};

type CommandResult = Result<(), Box<dyn Error>>;

/// Read a RON file, or the type's defaults when no path is given
fn load_ron<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, Box<dyn Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            Ok(ron::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))?)
        }
        None => Ok(T::default()),
    }
}

/// Parse `element=value`
pub fn parse_offset(arg: &str) -> Result<(String, f64), Box<dyn Error>> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("offset '{arg}' is not of the form element=value"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("offset '{arg}': {e}"))?;
    Ok((name.trim().to_string(), value))
}

fn find_element<'a>(assembly: &'a Assembly, name: &str) -> Result<&'a Element, Box<dyn Error>> {
    assembly
        .elements
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| format!("no element named '{name}'").into())
}

fn print_poses(assembly: &Assembly) {
    println!("{:<24} {:>30} {:>12}", "element", "position", "dl");
    for element in &assembly.elements {
        let p = element.position;
        println!(
            "{:<24} {:>30} {:>12.4}",
            element.name,
            format!("({:.3}, {:.3}, {:.3})", p.x, p.y, p.z),
            element.dl_current
        );
    }
}

fn print_outcome(outcome: SolveOutcome) {
    match outcome {
        SolveOutcome::Converged { iterations, groups } => {
            info!("Converged after {iterations} iterations over {groups} groups");
        }
        SolveOutcome::Skipped => info!("Solve skipped, another solve is running"),
    }
}

fn save(project: &Project, assembly: Assembly, output: Option<&Path>) -> CommandResult {
    if let Some(path) = output {
        let solved = Project::with_assembly(project.name.clone(), assembly, project.controls.clone());
        solved.save(path)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

/// Kinematic solve with optional offset overrides
pub fn kinematics(
    project_path: &Path,
    config: Option<&Path>,
    offsets: &[String],
    output: Option<&Path>,
) -> CommandResult {
    let project = Project::load(project_path)?;
    let config: SolverConfig = load_ron(config)?;
    info!("Loaded '{}' ({} elements)", project.name, project.assembly.elements.len());

    let mut solver = KinematicsSolver::new(project.assembly.clone(), project.controls.clone(), config)?;
    for arg in offsets {
        let (name, value) = parse_offset(arg)?;
        let element = find_element(solver.assembly(), &name)?.id;
        solver.set_controlled_offset(element, value)?;
    }

    print_outcome(solver.solve(&ConstraintsOptions::kinematics())?);
    print_poses(solver.assembly());
    save(&project, solver.into_assembly(), output)
}

fn print_forces(assembly: &Assembly, forces: &[ElementForces]) {
    for f in forces {
        let Some(element) = assembly.element(f.element) else {
            continue;
        };
        println!("{}", element.name);
        let named = element
            .fixed_points
            .iter()
            .zip(&f.fixed_point_forces)
            .chain(element.points.iter().zip(&f.point_forces));
        for (node, force) in named {
            if force.length() > 0.0 {
                println!("  {:<20} ({:.1}, {:.1}, {:.1}) N", node.name, force.x, force.y, force.z);
            }
        }
        if let Some(c) = f.contact_force {
            println!("  {:<20} ({:.1}, {:.1}, {:.1}) N", "contact", c.x, c.y, c.z);
        }
        if element.mass > 0.0 {
            let (g, c) = (f.gravity, f.centrifugal);
            println!("  {:<20} ({:.1}, {:.1}, {:.1}) N", "gravity", g.x, g.y, g.z);
            println!("  {:<20} ({:.1}, {:.1}, {:.1}) N", "centrifugal", c.x, c.y, c.z);
        }
    }
}

/// Staged skidpad solve
pub fn skidpad(
    project_path: &Path,
    config: Option<&Path>,
    skidpad: Option<&Path>,
    velocity: Option<f64>,
    output: Option<&Path>,
) -> CommandResult {
    let project = Project::load(project_path)?;
    let config: SolverConfig = load_ron(config)?;
    let mut skidpad: SkidpadConfig = load_ron(skidpad)?;
    if let Some(velocity) = velocity {
        skidpad.velocity = velocity;
    }
    info!("Skidpad for '{}' at {} m/s", project.name, skidpad.velocity);

    let mut solver = SkidpadSolver::new(project.assembly.clone(), project.controls.clone(), config, skidpad)?;
    let omega = solver.omega();
    let velocity = solver.skidpad_config().map_or(0.0, |c| c.velocity);
    println!("yaw rate      {omega:.6} rad/s");
    if omega.abs() > f64::EPSILON {
        println!("turn radius   {:.3} m", velocity / omega);
    }
    println!("drive error   {:.3} N", solver.drive_error());
    println!();
    print_forces(solver.assembly(), &solver.element_forces());
    info!("Largest residual {:e}", solver.max_residual(&skidpad_options()));
    save(&project, solver.assembly().clone(), output)
}

/// Build the graph and summarize its groups
pub fn check(project_path: &Path, config: Option<&Path>) -> CommandResult {
    let project = Project::load(project_path)?;
    let config: SolverConfig = load_ron(config)?;
    if let Err(errors) = project.assembly.validate() {
        for error in &errors {
            println!("{error}");
        }
        return Err(format!("{} validation error(s)", errors.len()).into());
    }

    let mut solver = KinematicsSolver::new(project.assembly, project.controls, config)?;
    let options = ConstraintsOptions::kinematics();
    let groups = solver.groups(&options);
    println!("{} groups", groups.len());
    for (i, group) in groups.iter().enumerate() {
        let names: Vec<&str> = group
            .variables
            .iter()
            .map(|v| solver.graph().variables[v.0].name())
            .collect();
        println!(
            "  group {i}: {} rows x {} columns, {} constraints [{}]",
            group.rows,
            group.columns,
            group.constraints.len(),
            names.join(", ")
        );
    }
    println!("largest residual {:e}", solver.max_residual(&options));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        let (name, value) = parse_offset("rack = -12.5").unwrap();
        assert_eq!(name, "rack");
        assert_eq!(value, -12.5);
        assert!(parse_offset("rack").is_err());
        assert!(parse_offset("rack=abc").is_err());
    }

    #[test]
    fn test_load_ron_defaults() {
        let config: SolverConfig = load_ron(None).unwrap();
        assert_eq!(config, SolverConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solver.ron");
        std::fs::write(&path, "(max_iterations: 12)").unwrap();
        let config: SolverConfig = load_ron(Some(&path)).unwrap();
        assert_eq!(config.max_iterations, 12);
    }
}
