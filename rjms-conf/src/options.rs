use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Delivery worker pool size, overrides `task.exec_workers`
    #[structopt(name = "exec-workers", long)]
    pub exec_workers: Option<usize>,

    /// Default queue depth limit, overrides `queue.max_depth`
    #[structopt(name = "queue-max-depth", long)]
    pub queue_max_depth: Option<usize>,
}
