//! Fixed-column text exchange with the external demarcation solver.
//!
//! Request layout, one value per line, each value left-justified in a
//! 20-character column and followed by its field name:
//!
//! ```text
//! 3                   numcrit
//! 0.800000            1
//! 0.950000            2
//! 1.000000            4
//! 0.1                 omega
//! 0.05                sigma
//! 2                   npop
//! 1.5                 step
//! 4                   nu
//! 1000                nrep
//! 4523917             iii
//! 1200                lenseq
//! 1                   whichavg
//! 0.0031              likelihoodsolution
//! ```
//!
//! The response holds two lines of the form `npop <value> likelihood <value>`:
//! the `npop = 1` candidate first, then the most likely `npop`.

use std::fmt::Write as _;

use ecosim_core::{EcosimError, Result};

use super::{AveragingCriterion, OracleRequest, OracleResponse, ParameterSet};
use crate::binning::BinLevel;

const COLUMN: usize = 20;

/// Render a request in the solver's input layout.
pub fn write_request(request: &OracleRequest) -> String {
    let mut out = String::new();
    push_field(&mut out, request.bins.len(), "numcrit");
    for level in &request.bins {
        let threshold = format!("{:.6}", level.threshold);
        push_field(&mut out, threshold, &level.cluster_count.to_string());
    }
    push_field(&mut out, request.omega, "omega");
    push_field(&mut out, request.sigma, "sigma");
    push_field(&mut out, request.npop, "npop");
    push_field(&mut out, request.step, "step");
    push_field(&mut out, request.sample_size, "nu");
    push_field(&mut out, request.replicates, "nrep");
    push_field(&mut out, request.seed, "iii");
    push_field(&mut out, request.sequence_length, "lenseq");
    push_field(&mut out, request.averaging.code(), "whichavg");
    push_field(&mut out, request.likelihood_solution, "likelihoodsolution");
    out
}

fn push_field(out: &mut String, value: impl std::fmt::Display, label: &str) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "{:<width$} {}", value.to_string(), label, width = COLUMN - 1);
}

/// Read a request back from the solver's input layout.
///
/// The iteration tag is not part of the file and must be supplied.
pub fn parse_request(text: &str, iteration: usize) -> Result<OracleRequest> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let mut next = |what: &str| {
        lines
            .next()
            .ok_or_else(|| EcosimError::InvalidInput(format!("request ends before {}", what)))
    };

    let n_levels: usize = value(next("numcrit")?, "numcrit")?;
    let mut bins = Vec::with_capacity(n_levels);
    for _ in 0..n_levels {
        let line = next("bin level")?;
        let mut fields = line.split_whitespace();
        let threshold = fields
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| EcosimError::InvalidInput(format!("bad bin line '{}'", line)))?;
        let count = fields
            .next()
            .and_then(|c| c.parse::<usize>().ok())
            .ok_or_else(|| EcosimError::InvalidInput(format!("bad bin line '{}'", line)))?;
        bins.push(BinLevel::new(threshold, count));
    }

    let omega = value(next("omega")?, "omega")?;
    let sigma = value(next("sigma")?, "sigma")?;
    let npop = value(next("npop")?, "npop")?;
    let step = value(next("step")?, "step")?;
    let sample_size = value(next("nu")?, "nu")?;
    let replicates = value(next("nrep")?, "nrep")?;
    let seed = value(next("iii")?, "iii")?;
    let sequence_length = value(next("lenseq")?, "lenseq")?;
    let averaging = AveragingCriterion::new(value(next("whichavg")?, "whichavg")?)?;
    let likelihood_solution = value(next("likelihoodsolution")?, "likelihoodsolution")?;

    Ok(OracleRequest {
        iteration,
        bins,
        omega,
        sigma,
        npop,
        step,
        sample_size,
        replicates,
        seed,
        sequence_length,
        averaging,
        likelihood_solution,
    })
}

fn value<T: std::str::FromStr>(line: &str, label: &str) -> Result<T> {
    let mut fields = line.split_whitespace();
    let raw = fields.next().unwrap_or_default();
    if fields.next() != Some(label) {
        return Err(EcosimError::InvalidInput(format!(
            "expected field '{}', found '{}'",
            label,
            line.trim()
        )));
    }
    raw.parse()
        .map_err(|_| EcosimError::InvalidInput(format!("bad value '{}' for {}", raw, label)))
}

/// Parse the solver's two-line answer.
///
/// Exactly two non-blank lines are expected. `omega` and `sigma` are those of the request; the solver only varies
/// `npop`. Blank lines are ignored and Fortran `D` exponents are accepted.
pub fn parse_response(text: &str, omega: f64, sigma: f64) -> Result<OracleResponse> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let [first, second] = lines.as_slice() else {
        return Err(EcosimError::OracleInvocation(format!(
            "response has {} line(s), expected 2",
            lines.len()
        )));
    };
    let single = parse_candidate(first, omega, sigma)?;
    let most_likely = parse_candidate(second, omega, sigma)?;
    Ok(OracleResponse {
        single,
        most_likely,
    })
}

fn parse_candidate(line: &str, omega: f64, sigma: f64) -> Result<ParameterSet> {
    let bad = |why: &str| {
        EcosimError::OracleInvocation(format!("malformed response line '{}': {}", line.trim(), why))
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [npop_key, npop_raw, lik_key, lik_raw] = fields.as_slice() else {
        return Err(bad("expected 'npop <value> likelihood <value>'"));
    };
    if !npop_key.eq_ignore_ascii_case("npop") || !lik_key.eq_ignore_ascii_case("likelihood") {
        return Err(bad("expected 'npop <value> likelihood <value>'"));
    }
    let npop = fortran_float(npop_raw).ok_or_else(|| bad("npop is not a number"))?;
    if npop.fract() != 0.0 || npop < 1.0 || npop > f64::from(u32::MAX) {
        return Err(bad("npop must be a positive integer"));
    }
    let likelihood = fortran_float(lik_raw).ok_or_else(|| bad("likelihood is not a number"))?;
    if !likelihood.is_finite() {
        return Err(bad("likelihood is not finite"));
    }
    Ok(ParameterSet::new(npop as u32, omega, sigma, likelihood))
}

fn fortran_float(raw: &str) -> Option<f64> {
    raw.replace(['D', 'd'], "E").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OracleRequest {
        OracleRequest {
            iteration: 5,
            bins: vec![
                BinLevel::new(0.8, 1),
                BinLevel::new(0.95, 2),
                BinLevel::new(1.0, 4),
            ],
            omega: 0.1,
            sigma: 0.05,
            npop: 2,
            step: 1.5,
            sample_size: 4,
            replicates: 1000,
            seed: 4523917,
            sequence_length: 1200,
            averaging: AveragingCriterion::new(1).unwrap(),
            likelihood_solution: 0.0031,
        }
    }

    #[test]
    fn request_layout() {
        let text = write_request(&request());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 14);
        assert_eq!(lines[0], "3                   numcrit");
        assert_eq!(lines[1], "0.800000            1");
        assert_eq!(lines[3], "1.000000            4");
        assert_eq!(lines[4], "0.1                 omega");
        assert_eq!(lines[10], "4523917             iii");
        assert_eq!(lines[13], "0.0031              likelihoodsolution");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn request_reads_back() {
        let original = request();
        let parsed = parse_request(&write_request(&original), 5).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn request_with_missing_field() {
        let text = write_request(&request());
        let truncated: String = text.lines().take(8).map(|l| format!("{}\n", l)).collect();
        assert!(parse_request(&truncated, 0).is_err());
        let swapped = text.replace("omega", "sigma");
        assert!(parse_request(&swapped, 0).is_err());
    }

    #[test]
    fn response_two_candidates() {
        let text = "npop 1 likelihood 0.25\nnpop 3 likelihood 0.5\n";
        let response = parse_response(text, 0.1, 0.2).unwrap();
        assert_eq!(response.single, ParameterSet::new(1, 0.1, 0.2, 0.25));
        assert_eq!(response.most_likely, ParameterSet::new(3, 0.1, 0.2, 0.5));
    }

    #[test]
    fn response_fortran_notation() {
        let text = "\n  npop  1.0  likelihood  0.1234D-01\n  npop  4  likelihood  0.5E+00\n";
        let response = parse_response(text, 1.0, 1.0).unwrap();
        assert!((response.single.likelihood - 0.01234).abs() < 1e-12);
        assert_eq!(response.most_likely.npop, 4);
    }

    #[test]
    fn response_rejects_bad_shapes() {
        for text in [
            "",
            "npop 1 likelihood 0.5\n",
            "npop 1 likelihood 0.5\nnpop two likelihood 0.5\n",
            "npop 1 likelihood 0.5\nnpop 0 likelihood 0.5\n",
            "npop 1 likelihood 0.5\nnpop 2.5 likelihood 0.5\n",
            "npop 1 likelihood 0.5\nnpop 2 lik 0.5\n",
            "npop 1 likelihood NaN\nnpop 2 likelihood 0.5\n",
            "npop 1 likelihood 0.5\nnpop 2 likelihood 0.5\nnpop 3 likelihood 0.7\n",
        ] {
            let err = parse_response(text, 1.0, 1.0).unwrap_err();
            assert!(matches!(err, EcosimError::OracleInvocation(_)), "{:?}", text);
        }
    }
}
