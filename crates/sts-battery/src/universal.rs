//! Maurer's "Universal" statistical test.
//!
//! The bitstream is cut into non-overlapping `L`-bit blocks. The first `Q`
//! blocks seed a table with the position of the last occurrence of every
//! block value; for each of the following `K` blocks the log2 distance back to
//! the previous occurrence of the same value is summed. A random source yields
//! an average distance close to the tabulated `EXPECTED_VALUE[L]`; a
//! compressible one does not.

use std::fmt;
use std::io::{self, Write};

use statrs::function::erf::erfc;

use crate::bits::BitBuffer;
use crate::driver::TestLifecycle;
use crate::error::{FatalError, Phase};
use crate::report::{self, ReportStyle};
use crate::scheduler::ThreadContext;
use crate::state::{Constants, PrivateStats, RunState, TestId, Verdict, classify_p_value};

const TEST: TestId = TestId::Universal;

/// Smallest supported block length.
pub const MIN_L: usize = 6;
/// Largest supported block length.
pub const MAX_L: usize = 16;
/// Minimum bitstream length: `1010 * 2^MIN_L * MIN_L`.
pub const MIN_UNIVERSAL: usize = 387_840;

/// Width of the signed integer used for block positions and size products.
const INDEX_BITS: usize = i64::BITS as usize;

/// Theoretical mean of `f_n` for a random source, indexed by `L`.
///
/// Menezes, van Oorschot, Vanstone, *Handbook of Applied Cryptography*,
/// section 5.4.5, column mu. Entries below `MIN_L` are unused.
pub const EXPECTED_VALUE: [f64; MAX_L + 1] = [
    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.2177052, 6.1962507, 7.1836656, 8.1764248, 9.1723243,
    10.170032, 11.168765, 12.168070, 13.167693, 14.167488, 15.167379,
];

/// Theoretical variance of a single log2 distance, indexed by `L` (column sigma^2(1)).
pub const VARIANCE: [f64; MAX_L + 1] = [
    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.954, 3.125, 3.238, 3.311, 3.356, 3.384, 3.401, 3.410,
    3.416, 3.419, 3.421,
];

/// Why the test cannot run for a given bitstream length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    TooShort { n: usize },
    BlockTooWide { l: usize },
    SizeOverflow { l: usize },
    OutOfRange { l: usize },
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::TooShort { n } => {
                write!(f, "requires bitcount(n): {n} >= {MIN_UNIVERSAL} for L >= {MIN_L}")
            }
            DisableReason::BlockTooWide { l } => write!(
                f,
                "L: {l} is too large and should be less than {} bits long",
                INDEX_BITS - 1
            ),
            DisableReason::SizeOverflow { l } => {
                write!(f, "L: {l} is too large, 1010 * 2^L * L overflows")
            }
            DisableReason::OutOfRange { l } => {
                write!(f, "L is out of range: {l} not in [{MIN_L}, {MAX_L}]")
            }
        }
    }
}

/// Bits needed for block length `l`: `1010 * 2^l * l`, or `None` on overflow.
fn required_bits(l: usize) -> Option<i64> {
    let l = i64::try_from(l).ok()?;
    1010i64.checked_mul(1i64.checked_shl(l as u32)?)?.checked_mul(l)
}

/// Largest `L` in `[MIN_L, MAX_L]` with `n >= 1010 * 2^L * L`.
pub fn select_block_length(n: usize) -> Result<usize, DisableReason> {
    if n < MIN_UNIVERSAL {
        return Err(DisableReason::TooShort { n });
    }
    let n_signed = i64::try_from(n).unwrap_or(i64::MAX);

    let mut l = MIN_L + 1;
    while l <= MAX_L {
        if l >= INDEX_BITS - 1 {
            return Err(DisableReason::BlockTooWide { l });
        }
        let required = required_bits(l).ok_or(DisableReason::SizeOverflow { l })?;
        if n_signed < required {
            break;
        }
        l += 1;
    }
    let l = l - 1;

    if !(MIN_L..=MAX_L).contains(&l) {
        return Err(DisableReason::OutOfRange { l });
    }
    Ok(l)
}

/// Block counts `(Q, K)` of the initialization and test segments for block length `l`.
pub fn segment_sizes(l: usize) -> Option<(usize, usize)> {
    let p = 1usize.checked_shl(u32::try_from(l).ok()?)?;
    let q = p.checked_mul(10)?;
    let k = q.checked_mul(100)?;
    Some((q, k))
}

/// Statistics of one iteration, written to stats.txt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UniversalStats {
    pub success: bool,
    /// Blocks in the initialization segment.
    pub q: usize,
    /// Blocks in the test segment.
    pub k: usize,
    /// Sum of the log2 distances between matching L-bit blocks.
    pub sum: f64,
    /// `c * sqrt(VARIANCE[L] / K)`.
    pub sigma: f64,
    /// Test statistic, `sum / K`.
    pub f_n: f64,
}

/// Sum of log2 recurrence distances over the test segment.
///
/// `table` must hold at least `2^l` entries; it is zeroed first.
pub fn block_distance_sum(
    bits: &BitBuffer,
    l: usize,
    q: usize,
    k: usize,
    table: &mut [usize],
    constants: &Constants,
) -> f64 {
    table.fill(0);

    for i in 1..=q {
        table[bits.block_value(i - 1, l)] = i;
    }

    let mut sum = 0.0;
    for i in (q + 1)..=(q + k) {
        let value = bits.block_value(i - 1, l);
        sum += ((i - table[value]) as f64).ln() / constants.ln2;
        table[value] = i;
    }
    sum
}

/// Compute the statistic and p-value for one bitstream.
///
/// The returned stats have `success == false`; the caller judges the p-value.
pub fn compute(
    bits: &BitBuffer,
    l: usize,
    table: &mut [usize],
    constants: &Constants,
) -> Option<(UniversalStats, f64)> {
    let (q, k) = segment_sizes(l)?;
    let sum = block_distance_sum(bits, l, q, k, table, constants);
    let f_n = sum / k as f64;

    let lf = l as f64;
    let c = 0.7 - 0.8 / lf + (4.0 + 32.0 / lf) * (k as f64).powf(-3.0 / lf) / 15.0;
    let sigma = c * (VARIANCE[l] / k as f64).sqrt();
    let arg = (f_n - EXPECTED_VALUE[l]).abs() / (constants.sqrt2 * sigma);
    let p_value = erfc(arg);

    let stat = UniversalStats {
        success: false,
        q,
        k,
        sum,
        sigma,
        f_n,
    };
    Some((stat, p_value))
}

/// Write one stats.txt record.
pub fn write_stat(
    out: &mut dyn Write,
    style: &dyn ReportStyle,
    n: usize,
    l: usize,
    stat: &UniversalStats,
    p_value: Option<f64>,
) -> io::Result<()> {
    style.stat_title(out, "Universal statistical test")?;
    writeln!(out, "\t\t--------------------------------------------")?;
    writeln!(out, "\t\t(a) L         = {l}")?;
    writeln!(out, "\t\t(b) Q         = {}", stat.q)?;
    writeln!(out, "\t\t(c) K         = {}", stat.k)?;
    writeln!(out, "\t\t(d) sum       = {:.6}", stat.sum)?;
    writeln!(out, "\t\t(e) sigma     = {:.6}", stat.sigma)?;
    writeln!(out, "\t\t(f) variance  = {:.6}", VARIANCE[l])?;
    writeln!(out, "\t\t(g) exp_value = {:.6}", EXPECTED_VALUE[l])?;
    writeln!(out, "\t\t(h) phi       = {:.6}", stat.f_n)?;
    let discarded = n as i64 - ((stat.q + stat.k) * l) as i64;
    style.discarded_bits(out, "(i)", discarded)?;
    writeln!(out, "\t\t-----------------------------------------")?;
    report::write_verdict(out, stat.success, p_value)
}

/// Lifecycle state of the Universal test. `l` is set by a successful init.
#[derive(Debug, Default)]
pub struct UniversalTest {
    l: Option<usize>,
}

impl UniversalTest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block length chosen at init.
    pub fn block_length(&self) -> Option<usize> {
        self.l
    }
}

impl TestLifecycle for UniversalTest {
    fn id(&self) -> TestId {
        TEST
    }

    fn init(&mut self, state: &mut RunState) -> Result<(), FatalError> {
        if !state.is_enabled(TEST) {
            log::debug!("init for {TEST} called while the test is disabled");
            return Ok(());
        }

        let l = match select_block_length(state.config.n) {
            Ok(l) => l,
            Err(reason) => {
                log::warn!("disabling test {TEST}: {reason}");
                state.disable(TEST);
                return Ok(());
            }
        };
        self.l = Some(l);

        let with_stats = state.config.write_results;
        let sub_dir = if with_stats {
            Some(report::prepare_sub_dir(state, TEST)?)
        } else {
            None
        };

        let expected = state.config.num_bitstreams;
        state
            .shared_mut()
            .tally_mut(TEST)
            .allocate(expected, with_stats)
            .map_err(|e| FatalError::alloc(TEST, Phase::Init, e))?;

        let slot = state.slot_mut(TEST);
        slot.initialized = true;
        slot.is_excursion = false;
        slot.p_values_per_iteration = 1;
        slot.sub_dir = sub_dir;
        log::debug!("{TEST} initialized with L = {l}");
        Ok(())
    }

    fn scratch_len(&self) -> usize {
        self.l.map_or(0, |l| 1usize << l)
    }

    fn iterate(
        &self,
        state: &RunState,
        ctx: &mut ThreadContext,
        bits: &BitBuffer,
    ) -> Result<(), FatalError> {
        if !state.is_enabled(TEST) {
            log::debug!("iterate for {TEST} called while the test is disabled");
            return Ok(());
        }
        let l = self.l.ok_or(FatalError::NotInitialized {
            test: TEST,
            phase: Phase::Iterate,
        })?;
        if !(MIN_L..=MAX_L).contains(&l) {
            return Err(FatalError::precondition(
                TEST,
                Phase::Iterate,
                format!("L is out of range: {l} not in [{MIN_L}, {MAX_L}]"),
            ));
        }
        let p = 1usize << l;
        if ctx.table.len() < p {
            return Err(FatalError::precondition(
                TEST,
                Phase::Iterate,
                format!(
                    "thread {} table has {} entries, need {p}",
                    ctx.thread_id,
                    ctx.table.len()
                ),
            ));
        }
        if bits.len() < state.config.n {
            return Err(FatalError::precondition(
                TEST,
                Phase::Iterate,
                format!(
                    "bitstream {} has {} bits, need {}",
                    ctx.iteration,
                    bits.len(),
                    state.config.n
                ),
            ));
        }

        let (mut stat, p_value) = compute(bits, l, &mut ctx.table[..p], &state.constants)
            .ok_or_else(|| {
                FatalError::precondition(
                    TEST,
                    Phase::Iterate,
                    format!("L: {l} is too large, 10 * 2^L overflows"),
                )
            })?;

        let verdict = classify_p_value(p_value, state.config.alpha);
        stat.success = verdict == Verdict::Success;
        if verdict == Verdict::Bogus {
            log::warn!(
                "iteration {} of test {TEST} produced bogus p_value: {p_value}",
                ctx.iteration + 1
            );
        }

        let mut shared = state.lock_shared();
        let tally = shared.tally_mut(TEST);
        tally.counters.record(verdict);
        tally
            .publish(ctx.iteration, Some(p_value), PrivateStats::Universal(stat))
            .map_err(|e| FatalError::alloc(TEST, Phase::Iterate, e))
    }

    fn print(&self, state: &mut RunState) -> Result<(), FatalError> {
        let n = state.config.n;
        let l = self.l;
        report::print_artifacts(state, TEST, |out, style, stat, p_value| {
            let PrivateStats::Universal(stat) = stat;
            let l = l.ok_or_else(|| io::Error::other("block length not set"))?;
            write_stat(out, style, n, l, stat, p_value)
        })
    }

    fn destroy(&mut self, state: &mut RunState) -> Result<(), FatalError> {
        if !state.is_enabled(TEST) {
            log::debug!("destroy for {TEST} called while the test is disabled");
            return Ok(());
        }
        state.shared_mut().tally_mut(TEST).release();
        let slot = state.slot_mut(TEST);
        slot.sub_dir = None;
        slot.initialized = false;
        self.l = None;
        Ok(())
    }
}
