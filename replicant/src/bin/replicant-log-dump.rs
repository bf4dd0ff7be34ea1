use arrrg::CommandLine;

use replicant::acceptor::dump_log;

#[derive(Clone, Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct LogDumpOptions {}

fn main() {
    let (_, files) =
        LogDumpOptions::from_command_line("USAGE: replicant-log-dump [<log.N> ...]");
    for file in files {
        let records = dump_log(&file).expect("could not read log");
        println!("{}:", file);
        for record in records {
            println!("{:?}", record);
        }
    }
}
