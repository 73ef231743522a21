use clap::ValueEnum;

/// How an explicit pid list is interpreted on every tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TargetMode {
    /// Use the listed pids verbatim for the whole session.
    #[default]
    Fixed,
    /// Treat the listed pids as roots and rediscover their descendants.
    Tree,
}
