/// Engine configuration, fixed for the lifetime of one engine invocation.
///
/// Owned and passed explicitly; there is no ambient global option state.
#[derive(Debug, Clone)]
pub struct SlpConfig {
    /// Number of lanes per superword (the target vector width).
    pub width: usize,
    /// Recursion bound for the look-ahead score during operand reordering.
    pub max_look_ahead: usize,
    /// Maximum number of superwords a single multinode may accumulate.
    pub max_node_size: usize,
    /// Maximum number of vectorization attempts per block.
    pub max_attempts: usize,
    /// Stop after this many committed (successful) attempts per block.
    pub max_successful_iterations: usize,
    /// Retained for host compatibility. The DFS-based instruction reorder it
    /// selected has been superseded by the depth-based re-linearization and
    /// this flag no longer changes behavior.
    pub reorder_instructions_dfs: bool,
    /// Allow one scalar value to occupy several lanes of a superword.
    pub allow_duplicate_elements: bool,
    /// Allow seeds whose elements transitively depend on each other.
    pub allow_topological_mixing: bool,
    /// Use the deep structural look-ahead (operand pair matching per level)
    /// instead of shallow opcode comparison when reordering operands.
    pub use_xor_chains: bool,
}

impl Default for SlpConfig {
    fn default() -> Self {
        Self {
            width: 4,
            max_look_ahead: 3,
            max_node_size: 24,
            max_attempts: 4,
            max_successful_iterations: 1,
            reorder_instructions_dfs: true,
            allow_duplicate_elements: true,
            allow_topological_mixing: false,
            use_xor_chains: true,
        }
    }
}

impl SlpConfig {
    pub fn with_width(width: usize) -> Self {
        Self {
            width,
            ..Self::default()
        }
    }
}
