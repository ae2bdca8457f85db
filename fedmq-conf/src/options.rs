use structopt::StructOpt;

use fedmq_utils::BrokerId;

#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Broker id
    #[structopt(name = "id", long)]
    pub broker_id: Option<BrokerId>,

    /// Broker name
    #[structopt(name = "name", long)]
    pub broker_name: Option<String>,
}
