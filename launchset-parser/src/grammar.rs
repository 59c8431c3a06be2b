use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "args.pest"]
pub struct ArgsParser;
