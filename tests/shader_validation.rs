//! WGSL validation for every kernel variant.
//!
//! The kernel sources are assembled with `format!` from shared snippets,
//! so a template edit can break a variant that no host test exercises.
//! Running every combination through naga catches that without a GPU.

use ngrav::shader_sources as shaders;
use ngrav::Assignment;

fn validate(label: &str, source: &str) {
    let module = naga::front::wgsl::parse_str(source)
        .unwrap_or_else(|e| panic!("{}: WGSL parse error: {:?}\n{}", label, e, source));

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .unwrap_or_else(|e| panic!("{}: WGSL validation error: {:?}\n{}", label, e, source));
}

#[test]
fn deposit_shaders_validate() {
    for assignment in [Assignment::Ngp, Assignment::Cic] {
        for channels in [1u32, 4] {
            validate(
                &format!("deposit {:?} ch{}", assignment, channels),
                &shaders::deposit_wgsl(assignment, channels),
            );
        }
    }
    validate("deposit merge", shaders::MERGE_SHADER);
    validate("deposit clear", shaders::CLEAR_SHADER);
}

#[test]
fn fft_shaders_validate() {
    for channels in [1u32, 4] {
        validate(
            &format!("fft convert ch{}", channels),
            &shaders::convert_wgsl(channels),
        );
    }
    validate("fft stage", &shaders::stage_wgsl());
    validate("fft extract", &shaders::extract_wgsl());
    validate("fft copy", shaders::COPY_SHADER);
}

#[test]
fn spectral_shaders_validate() {
    validate("poisson", &shaders::poisson_wgsl());
    validate("gradient", &shaders::gradient_wgsl());
    validate("force sample", &shaders::sample_wgsl());
}

#[test]
fn near_field_shaders_validate() {
    for radius in 1..=4u32 {
        validate(
            &format!("near field r{}", radius),
            &shaders::near_field_wgsl(radius),
        );
    }
}

#[test]
fn aggregate_shaders_validate() {
    for quadrupole in [false, true] {
        validate(
            &format!("aggregate scatter quad={}", quadrupole),
            &shaders::scatter_wgsl(quadrupole),
        );
        for mask in [false, true] {
            validate(
                &format!("aggregate merge quad={} mask={}", quadrupole, mask),
                &shaders::merge_wgsl(quadrupole, mask),
            );
        }
        validate(
            &format!("pyramid quad={}", quadrupole),
            &shaders::pyramid_wgsl(quadrupole),
        );
    }
    validate("occupancy clear", shaders::MASK_CLEAR_SHADER);
}

#[test]
fn traversal_shaders_validate() {
    for quadrupole in [false, true] {
        for mask in [false, true] {
            for radius in [1u32, 2] {
                validate(
                    &format!("traversal quad={} mask={} r{}", quadrupole, mask, radius),
                    &shaders::traversal_wgsl(quadrupole, mask, radius),
                );
            }
        }
    }
}

#[test]
fn reduction_and_integrator_shaders_validate() {
    validate("bounds partial", shaders::PARTIAL_SHADER);
    validate("bounds final", shaders::FINAL_SHADER);
    validate("kick", shaders::KICK_SHADER);
    validate("drift", shaders::DRIFT_SHADER);
}
