use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use crate::{
    api,
    challenge::{SolveContext, Solver},
    Error, ObtainError,
};

/// Solvers by challenge type tag.
#[derive(Clone, Default)]
pub(crate) struct SolverRegistry {
    solvers: HashMap<String, Arc<dyn Solver>>,
}

impl SolverRegistry {
    pub(crate) fn register(&mut self, challenge_type: impl Into<String>, solver: Arc<dyn Solver>) {
        self.solvers.insert(challenge_type.into(), solver);
    }

    pub(crate) fn exclude(&mut self, challenge_type: &str) {
        self.solvers.remove(challenge_type);
    }

    pub(crate) fn types(&self) -> Vec<&str> {
        let mut types = self.solvers.keys().map(String::as_str).collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    /// First challenge, in server order, that has a registered solver.
    fn select<'a>(&self, authz: &'a api::Authorization) -> Option<SelectedAuthSolver<'a>> {
        authz
            .challenges
            .iter()
            .enumerate()
            .find_map(|(challenge_idx, challenge)| {
                let solver = self.solvers.get(&challenge._type)?;
                Some(SelectedAuthSolver {
                    authz,
                    challenge_idx,
                    solver: Arc::clone(solver),
                })
            })
    }
}

/// An authorization paired with the challenge it will be proven by.
struct SelectedAuthSolver<'a> {
    authz: &'a api::Authorization,
    challenge_idx: usize,
    solver: Arc<dyn Solver>,
}

impl SelectedAuthSolver<'_> {
    fn domain(&self) -> &str {
        self.authz.domain()
    }

    fn challenge(&self) -> &api::Challenge {
        &self.authz.challenges[self.challenge_idx]
    }
}

/// Brings every authorization that is not yet valid to the valid state.
///
/// Domains are attempted independently: a failure is recorded and the remaining domains still go
/// through all phases. Returns `None` only when every domain succeeded.
pub(crate) async fn solve_for_authorizations(
    registry: &SolverRegistry,
    ctx: &SolveContext<'_>,
    authzs: &[api::Authorization],
) -> Option<ObtainError> {
    let mut failures = BTreeMap::new();
    let mut selected = Vec::new();

    for authz in authzs {
        let domain = authz.domain();

        if authz.is_status_valid() {
            log::info!("[{domain}] acme: authorization already valid; skipping challenge");
            continue;
        }

        match registry.select(authz) {
            Some(pair) => selected.push(pair),
            None => {
                let offered = authz
                    .challenges
                    .iter()
                    .map(|challenge| challenge._type.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");

                failures.insert(
                    domain.to_owned(),
                    Error::protocol(format!(
                        "could not determine solvers; offered [{offered}], registered [{}]",
                        registry.types().join(", ")
                    )),
                );
            }
        }
    }

    let mut solvable = Vec::with_capacity(selected.len());

    for pair in selected {
        if let Some(pre_solver) = pair.solver.pre_solver() {
            if let Err(err) = pre_solver.pre_solve(ctx, pair.authz, pair.challenge()).await {
                failures.insert(pair.domain().to_owned(), err);
                continue;
            }
        }

        solvable.push(pair);
    }

    for pair in &solvable {
        if let Err(err) = pair.solver.solve(ctx, pair.authz, pair.challenge()).await {
            failures.insert(pair.domain().to_owned(), err);
        }
    }

    for pair in &solvable {
        let Some(cleanup) = pair.solver.cleanup() else {
            continue;
        };

        if let Err(err) = cleanup.clean_up(ctx, pair.authz, pair.challenge()).await {
            log::warn!("[{}] acme: cleaning up failed: {err}", pair.domain());
        }
    }

    ObtainError::from_failures(failures)
}
