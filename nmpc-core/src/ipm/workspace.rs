//! Preallocated iteration storage. Everything the loop touches is
//! sized once so the hot path never allocates.

/// Primal-dual iterate: variables, equality multipliers, inequality
/// multipliers, and slacks. `s` and `l` stay strictly positive.
pub struct Iterate {
    pub z: Vec<f64>,
    pub y: Vec<f64>,
    pub l: Vec<f64>,
    pub s: Vec<f64>,
}

impl Iterate {
    pub fn new(nz: usize, me: usize, mi: usize) -> Self {
        Self {
            z: vec![0.0; nz],
            y: vec![0.0; me],
            l: vec![0.0; mi],
            s: vec![0.0; mi],
        }
    }

    pub fn copy_from(&mut self, other: &Iterate) {
        self.z.copy_from_slice(&other.z);
        self.y.copy_from_slice(&other.y);
        self.l.copy_from_slice(&other.l);
        self.s.copy_from_slice(&other.s);
    }
}

/// Search direction in the same layout as [`Iterate`].
pub struct Direction {
    pub dz: Vec<f64>,
    pub dy: Vec<f64>,
    pub dl: Vec<f64>,
    pub ds: Vec<f64>,
}

impl Direction {
    pub fn new(nz: usize, me: usize, mi: usize) -> Self {
        Self {
            dz: vec![0.0; nz],
            dy: vec![0.0; me],
            dl: vec![0.0; mi],
            ds: vec![0.0; mi],
        }
    }
}

pub struct IpmWorkspace {
    pub cur: Iterate,
    pub trial: Iterate,
    pub aff: Direction,
    pub cc: Direction,
    pub soc: Direction,
    /// Stationarity residual at the current iterate.
    pub r_d: Vec<f64>,
    /// Equality residual at the current iterate.
    pub r_eq: Vec<f64>,
    /// Inequality residual `h + s` at the current iterate.
    pub r_in: Vec<f64>,
    /// Barrier weights `l / s`.
    pub w: Vec<f64>,
    /// Complementarity right-hand side for the active solve.
    pub rc: Vec<f64>,
    pub tmp_mi: Vec<f64>,
    pub rhs_z: Vec<f64>,
    pub rhs_y: Vec<f64>,
    pub eq_target_trial: Vec<f64>,
    pub h_trial: Vec<f64>,
    pub r_eq_trial: Vec<f64>,
    pub r_in_trial: Vec<f64>,
    pub r_eq_soc: Vec<f64>,
    pub r_in_soc: Vec<f64>,
}

impl IpmWorkspace {
    pub fn new(nz: usize, me: usize, mi: usize) -> Self {
        Self {
            cur: Iterate::new(nz, me, mi),
            trial: Iterate::new(nz, me, mi),
            aff: Direction::new(nz, me, mi),
            cc: Direction::new(nz, me, mi),
            soc: Direction::new(nz, me, mi),
            r_d: vec![0.0; nz],
            r_eq: vec![0.0; me],
            r_in: vec![0.0; mi],
            w: vec![0.0; mi],
            rc: vec![0.0; mi],
            tmp_mi: vec![0.0; mi],
            rhs_z: vec![0.0; nz],
            rhs_y: vec![0.0; me],
            eq_target_trial: vec![0.0; me],
            h_trial: vec![0.0; mi],
            r_eq_trial: vec![0.0; me],
            r_in_trial: vec![0.0; mi],
            r_eq_soc: vec![0.0; me],
            r_in_soc: vec![0.0; mi],
        }
    }

    /// Promotes the trial point and its constraint residuals to the
    /// current iterate after line-search acceptance.
    pub fn commit_trial(&mut self) {
        self.cur.copy_from(&self.trial);
        self.r_eq.copy_from_slice(&self.r_eq_trial);
        self.r_in.copy_from_slice(&self.r_in_trial);
    }
}

/// `trial = base + alpha * dir`.
pub fn step_into(trial: &mut Iterate, base: &Iterate, alpha: f64, dir: &Direction) {
    for (t, (b, d)) in trial.z.iter_mut().zip(base.z.iter().zip(&dir.dz)) {
        *t = b + alpha * d;
    }
    for (t, (b, d)) in trial.y.iter_mut().zip(base.y.iter().zip(&dir.dy)) {
        *t = b + alpha * d;
    }
    for (t, (b, d)) in trial.l.iter_mut().zip(base.l.iter().zip(&dir.dl)) {
        *t = b + alpha * d;
    }
    for (t, (b, d)) in trial.s.iter_mut().zip(base.s.iter().zip(&dir.ds)) {
        *t = b + alpha * d;
    }
}
